//! Narration events → `data:` frames.
//!
//! Frames are `data: <json>\n\n`.  A relay that reaches a terminal event
//! (or synthesizes one because the source ended early) writes
//! [`DONE_FRAME`] exactly once.  A relay that loses its client writes
//! nothing more, drops the event source so the producer stops, and closes
//! the sink.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::narrator::{NarrationEvent, NarrationStream};
use crate::orchestrator::ChatResponse;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// JSON payload of one frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame<'a> {
    Start {
        success: bool,
        #[serde(rename = "cortexData")]
        cortex_data: &'a ChatResponse,
    },
    Chunk {
        content: &'a str,
    },
    Complete,
    Error {
        error: &'a str,
        timestamp: String,
    },
}

impl<'a> WireFrame<'a> {
    pub fn from_event(event: &'a NarrationEvent) -> Self {
        match event {
            NarrationEvent::Start(response) => WireFrame::Start {
                success: true,
                cortex_data: response,
            },
            NarrationEvent::Chunk(text) => WireFrame::Chunk { content: text },
            NarrationEvent::Complete => WireFrame::Complete,
            NarrationEvent::Error(message) => WireFrame::error(message),
        }
    }

    pub fn error(message: &'a str) -> Self {
        WireFrame::Error {
            error: message,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn encode(&self) -> Bytes {
        match serde_json::to_string(self) {
            Ok(json) => Bytes::from(format!("data: {json}\n\n")),
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                let fallback = serde_json::json!({
                    "type": "error",
                    "error": format!("failed to encode frame: {e}"),
                    "timestamp": Utc::now().to_rfc3339(),
                });
                Bytes::from(format!("data: {fallback}\n\n"))
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("client connection closed")]
pub struct SinkClosed;

/// Transport side of a stream.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Whether the client is still there.  Checked before every write.
    fn is_open(&self) -> bool;

    async fn write(&mut self, frame: Bytes) -> Result<(), SinkClosed>;

    /// Resolves when the client goes away.  Sinks without a close signal
    /// never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// Best-effort; idempotent.
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// `complete` and `[DONE]` written.
    Completed,
    /// `error` and `[DONE]` written.
    Failed,
    /// The client left; nothing was written after it did.
    Disconnected { frames_written: usize },
}

/// Drive `events` into `sink` until a terminal frame or disconnect.
pub async fn relay<S>(mut events: NarrationStream, sink: &mut S) -> RelayOutcome
where
    S: FrameSink + ?Sized,
{
    let mut frames_written = 0usize;

    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = sink.closed() => return abandon(events, sink, frames_written).await,
        };
        if !sink.is_open() {
            return abandon(events, sink, frames_written).await;
        }

        let (frame, outcome) = match &event {
            Some(ev) => {
                let outcome = match ev {
                    NarrationEvent::Complete => Some(RelayOutcome::Completed),
                    NarrationEvent::Error(_) => Some(RelayOutcome::Failed),
                    _ => None,
                };
                (WireFrame::from_event(ev).encode(), outcome)
            }
            None => {
                warn!(frames_written, "narration ended without a terminal event");
                (
                    WireFrame::error("stream ended unexpectedly").encode(),
                    Some(RelayOutcome::Failed),
                )
            }
        };

        if sink.write(frame).await.is_err() {
            return abandon(events, sink, frames_written).await;
        }
        frames_written += 1;

        if let Some(outcome) = outcome {
            if sink.write(Bytes::from_static(DONE_FRAME.as_bytes())).await.is_err() {
                debug!("client left before [DONE]");
            }
            sink.close().await;
            debug!(?outcome, frames_written, "stream finished");
            return outcome;
        }
    }
}

async fn abandon<S>(events: NarrationStream, sink: &mut S, frames_written: usize) -> RelayOutcome
where
    S: FrameSink + ?Sized,
{
    info!(frames_written, "client disconnected; abandoning stream");
    drop(events);
    sink.close().await;
    RelayOutcome::Disconnected { frames_written }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
