//! Chat-completions narration backend.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NarratorConfig;
use crate::error::GatewayError;
use crate::narrator::{FragmentStream, NarrationBackend, NarrationRequest};

const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaChunk {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Splits an SSE body into `data:` payloads, however the bytes are chunked.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_owned());
            }
        }
        payloads
    }
}

/// Turns one decoded payload into a fragment; `None` for empty deltas.
fn delta_text(payload: &str) -> Result<Option<String>, GatewayError> {
    let chunk: DeltaChunk = serde_json::from_str(payload)
        .map_err(|e| GatewayError::Narration(format!("malformed stream chunk: {e}")))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty()))
}

struct DeltaStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, GatewayError>>,
    finished: bool,
}

impl DeltaStream {
    fn absorb(&mut self, bytes: &[u8]) {
        for payload in self.decoder.feed(bytes) {
            if payload == DONE_MARKER {
                self.finished = true;
                return;
            }
            match delta_text(&payload) {
                Ok(Some(text)) => self.pending.push_back(Ok(text)),
                Ok(None) => {}
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                    return;
                }
            }
        }
    }
}

fn fragments(body: BoxStream<'static, reqwest::Result<Bytes>>) -> FragmentStream {
    let state = DeltaStream {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => st.absorb(&bytes),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(GatewayError::Narration(e.to_string())), st));
                }
                None => st.finished = true,
            }
        }
    })
    .boxed()
}

/// Narration over an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsBackend {
    http: Client,
    config: NarratorConfig,
}

impl ChatCompletionsBackend {
    pub fn new(http: Client, config: NarratorConfig) -> Self {
        Self { http, config }
    }

    async fn send(
        &self,
        request: &NarrationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        };

        let mut builder = self
            .http
            .post(&self.config.endpoint)
            .timeout(self.config.http_timeout)
            .json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(model = %self.config.model, stream, "calling narration backend");
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::Narration(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Narration(format!(
                "narration backend returned {status}: {}",
                text.trim()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl NarrationBackend for ChatCompletionsBackend {
    async fn complete(&self, request: NarrationRequest) -> Result<String, GatewayError> {
        let response: CompletionResponse = self
            .send(&request, false)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Narration(format!("malformed completion: {e}")))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GatewayError::Narration("completion had no content".into()))
    }

    async fn stream(&self, request: NarrationRequest) -> Result<FragmentStream, GatewayError> {
        let response = self.send(&request, true).await?;
        Ok(fragments(response.bytes_stream().boxed()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    fn body(parts: &[&'static str]) -> BoxStream<'static, reqwest::Result<Bytes>> {
        let items: Vec<reqwest::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        futures::stream::iter(items).boxed()
    }

    async fn collect(parts: &[&'static str]) -> Vec<Result<String, String>> {
        fragments(body(parts))
            .map(|r| r.map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[test]
    fn decoder_handles_split_lines_and_crlf() {
        let mut d = SseDecoder::default();
        assert!(d.feed(b"data: {\"a\"").is_empty());
        assert_eq!(d.feed(b":1}\r\n\r\nda"), vec![r#"{"a":1}"#]);
        assert_eq!(d.feed(b"ta: [DONE]\n\n"), vec!["[DONE]"]);
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut d = SseDecoder::default();
        assert!(d.feed(b": keep-alive\nevent: message\nid: 7\n\n").is_empty());
    }

    #[tokio::test]
    async fn deltas_become_fragments_until_done() {
        let out = collect(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"EU leads\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\" with 100.\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n\n",
        ])
        .await;

        assert_eq!(out, vec![Ok("EU leads".to_owned()), Ok(" with 100.".to_owned())]);
    }

    #[tokio::test]
    async fn malformed_chunk_ends_stream_with_error() {
        let out = collect(&["data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: nope\n\n"]).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok("ok".to_owned()));
        assert!(out[1].as_ref().unwrap_err().contains("malformed stream chunk"));
    }

    #[test]
    fn request_body_shape() {
        let req = CompletionRequest {
            model: "gpt-4o-mini",
            messages: [
                ChatMessage {
                    role: "system",
                    content: "be brief",
                },
                ChatMessage {
                    role: "user",
                    content: "explain",
                },
            ],
            max_tokens: None,
            temperature: 0.0,
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [
                    { "role": "system", "content": "be brief" },
                    { "role": "user", "content": "explain" }
                ],
                "temperature": 0.0,
                "stream": true
            })
        );
    }
}
