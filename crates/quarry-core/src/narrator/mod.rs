//! Narrated explanations of query results.
//!
//! [`ResponseNarrator`] truncates a [`ChatResponse`] into a prompt and hands
//! it to a [`NarrationBackend`], either for one block of text
//! ([`ResponseNarrator::enhance`]) or as a stream of [`NarrationEvent`]s
//! delivered over a bounded channel ([`ResponseNarrator::enhance_stream`]).
//!
//! The streaming producer never raises: every failure becomes a single
//! [`NarrationEvent::Error`].  Dropping the [`NarrationStream`] stops the
//! producer at its next await point.

pub mod openai;
pub mod truncate;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::NarratorConfig;
use crate::error::GatewayError;
use crate::orchestrator::ChatResponse;

pub use openai::ChatCompletionsBackend;

/// One step of a streamed answer.
#[derive(Debug, Clone)]
pub enum NarrationEvent {
    /// Always first; carries the untruncated response.
    Start(Arc<ChatResponse>),
    Chunk(String),
    Complete,
    Error(String),
}

/// How a producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrationOutcome {
    Completed,
    Failed,
    /// The receiver was dropped first.
    Abandoned,
}

impl NarrationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NarrationEvent::Complete | NarrationEvent::Error(_))
    }
}

/// Receiving half of a narration; consumed exactly once.
pub type NarrationStream = mpsc::Receiver<NarrationEvent>;

/// Text fragments produced by a streaming backend.
pub type FragmentStream = BoxStream<'static, Result<String, GatewayError>>;

/// System/user message pair sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrationRequest {
    pub system: String,
    pub user: String,
}

/// A language-generation service.
#[async_trait]
pub trait NarrationBackend: Send + Sync {
    async fn complete(&self, request: NarrationRequest) -> Result<String, GatewayError>;

    async fn stream(&self, request: NarrationRequest) -> Result<FragmentStream, GatewayError>;
}

pub struct ResponseNarrator {
    backend: Arc<dyn NarrationBackend>,
    system_prompt: String,
    channel_capacity: usize,
}

impl ResponseNarrator {
    pub fn new(backend: Arc<dyn NarrationBackend>, config: &NarratorConfig) -> Self {
        Self {
            backend,
            system_prompt: config.system_prompt.clone(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    fn request_for(&self, response: &ChatResponse) -> NarrationRequest {
        let payload = truncate::prepare(response);
        if let Some(note) = &payload.note {
            debug!(note = %note, "narration payload truncated");
        }
        NarrationRequest {
            system: self.system_prompt.clone(),
            user: payload.render(),
        }
    }

    /// Narrate `response` in one block.
    pub async fn enhance(&self, response: &ChatResponse) -> Result<String, GatewayError> {
        let request = self.request_for(response);
        self.backend.complete(request).await
    }

    /// Narrate `response` on a background task.
    pub fn enhance_stream(self: &Arc<Self>, response: Arc<ChatResponse>) -> NarrationStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let narrator = Arc::clone(self);
        tokio::spawn(async move {
            narrator.stream_into(response, &tx).await;
        });
        rx
    }

    /// Write `Start`, the chunks, and one terminal event into `tx`.
    ///
    /// Returns early, without a terminal event, once the receiver is gone.
    pub async fn stream_into(
        &self,
        response: Arc<ChatResponse>,
        tx: &mpsc::Sender<NarrationEvent>,
    ) -> NarrationOutcome {
        let request = self.request_for(&response);
        if tx.send(NarrationEvent::Start(response)).await.is_err() {
            return NarrationOutcome::Abandoned;
        }

        let opened = tokio::select! {
            _ = tx.closed() => {
                debug!("narration consumer gone before backend answered");
                return NarrationOutcome::Abandoned;
            }
            opened = self.backend.stream(request) => opened,
        };
        let mut fragments = match opened {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "narration stream failed to start");
                let _ = tx.send(NarrationEvent::Error(e.to_string())).await;
                return NarrationOutcome::Failed;
            }
        };

        let mut chunks = 0usize;
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    debug!(chunks, "narration consumer gone; stopping");
                    return NarrationOutcome::Abandoned;
                }
                next = fragments.next() => next,
            };
            match next {
                Some(Ok(text)) => {
                    chunks += 1;
                    if tx.send(NarrationEvent::Chunk(text)).await.is_err() {
                        return NarrationOutcome::Abandoned;
                    }
                }
                Some(Err(e)) => {
                    warn!(chunks, error = %e, "narration stream failed");
                    let _ = tx.send(NarrationEvent::Error(e.to_string())).await;
                    return NarrationOutcome::Failed;
                }
                None => {
                    debug!(chunks, "narration stream complete");
                    let _ = tx.send(NarrationEvent::Complete).await;
                    return NarrationOutcome::Completed;
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::testing::{ScriptedNarration, sample_response};

    fn narrator(backend: &ScriptedNarration) -> Arc<ResponseNarrator> {
        Arc::new(ResponseNarrator::new(
            Arc::new(backend.clone()),
            &NarratorConfig::default(),
        ))
    }

    async fn drain(mut rx: NarrationStream) -> Vec<NarrationEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn enhance_sends_instruction_and_truncated_result() {
        let backend = ScriptedNarration::new(["EU", " leads."]);
        let text = narrator(&backend).enhance(&sample_response()).await.unwrap();

        assert_eq!(text, "EU leads.");
        let request = backend.requests().pop().unwrap();
        assert_eq!(request.system, NarratorConfig::default().system_prompt);
        assert!(request.user.contains("SELECT region, revenue FROM sales"));
        assert!(request.user.contains("\"EU\""));
    }

    #[tokio::test]
    async fn stream_yields_start_chunks_complete() {
        let backend = ScriptedNarration::new(["Revenue ", "is up."]);
        let response = Arc::new(sample_response());
        let events = drain(narrator(&backend).enhance_stream(Arc::clone(&response))).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], NarrationEvent::Start(r) if Arc::ptr_eq(r, &response)));
        assert!(matches!(&events[1], NarrationEvent::Chunk(t) if t == "Revenue "));
        assert!(matches!(&events[2], NarrationEvent::Chunk(t) if t == "is up."));
        assert!(matches!(events[3], NarrationEvent::Complete));
    }

    #[tokio::test]
    async fn backend_failure_becomes_single_error_event() {
        let backend = ScriptedNarration::new(["partial"]).failing_after(1, "upstream reset");
        let events = drain(narrator(&backend).enhance_stream(Arc::new(sample_response()))).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], NarrationEvent::Error(m) if m.contains("upstream reset")));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn refused_stream_is_reported_after_start() {
        let backend = ScriptedNarration::new(Vec::<String>::new()).refusing("model not found");
        let events = drain(narrator(&backend).enhance_stream(Arc::new(sample_response()))).await;

        assert!(matches!(events[0], NarrationEvent::Start(_)));
        assert!(matches!(&events[1], NarrationEvent::Error(m) if m.contains("model not found")));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_receiver_stops_producer() {
        let backend = ScriptedNarration::new((0..100).map(|i| format!("t{i} ")))
            .with_delay(Duration::from_millis(10));
        let mut rx = narrator(&backend).enhance_stream(Arc::new(sample_response()));

        assert!(matches!(rx.recv().await, Some(NarrationEvent::Start(_))));
        assert!(matches!(rx.recv().await, Some(NarrationEvent::Chunk(_))));
        drop(rx);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(backend.fragments_pulled() < 100);
    }
}
