// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{BackendError, ChatBackend, ChunkStream};
use crate::types::{ChatChunk, ChatRequest, ChatResponse, ModelSummary, ShowModelResponse};

/// Client for an Ollama-compatible chat server.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BackendError::Auth(body));
        }
        Err(BackendError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(
        &self,
        mut req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        req.stream = true;
        debug!(
            model = %req.model,
            message_count = req.messages.len(),
            num_ctx = ?req.options.num_ctx,
            has_tools = req.tools.is_some(),
            "sending streaming chat request"
        );

        let send = self.client.post(self.url("/api/chat")).json(&req).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            r = send => r.map_err(|e| BackendError::Request(e.to_string()))?,
        };
        let resp = Self::check_status(resp).await?;

        // NDJSON chunks can be split across TCP packets.  Maintain a line
        // buffer across chunks; emit a ChatChunk only for complete lines.
        let byte_stream = resp.bytes_stream();
        let chunk_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let out: Vec<Result<ChatChunk, BackendError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_lines(buf)
                    }
                    Err(e) => vec![Err(BackendError::Stream(e.to_string()))],
                };
                std::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }

    async fn chat_no_stream(&self, mut req: ChatRequest) -> Result<ChatResponse, BackendError> {
        req.stream = false;
        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&req)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| BackendError::Stream(e.to_string()))
    }

    async fn list_models(&self) -> Result<Vec<ModelSummary>, BackendError> {
        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<ModelSummary>,
        }
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        let tags: Tags = resp
            .json()
            .await
            .map_err(|e| BackendError::Stream(e.to_string()))?;
        Ok(tags.models)
    }

    async fn show_model(&self, name: &str) -> Result<ShowModelResponse, BackendError> {
        let resp = self
            .client
            .post(self.url("/api/show"))
            .json(&serde_json::json!({ "model": name }))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<ShowModelResponse>()
            .await
            .map_err(|e| BackendError::Stream(e.to_string()))
    }
}

/// Drain all complete `\n`-terminated NDJSON lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
fn drain_complete_lines(buf: &mut String) -> Vec<Result<ChatChunk, BackendError>> {
    let mut out = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line = buf[..nl].trim_end_matches('\r').to_string();
        *buf = buf[nl + 1..].to_string();
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChatChunk>(&line) {
            Ok(chunk) => out.push(Ok(chunk)),
            Err(e) => out.push(Err(BackendError::Stream(format!(
                "malformed chunk: {e}: {line}"
            )))),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_emits_complete_lines_only() {
        let mut buf = String::from("{\"done\":false}\n{\"done\":tr");
        let out = drain_complete_lines(&mut buf);
        assert_eq!(out.len(), 1);
        assert_eq!(buf, "{\"done\":tr");
    }

    #[test]
    fn drain_handles_multiple_lines_in_one_chunk() {
        let mut buf = String::from(
            "{\"message\":{\"content\":\"a\"}}\n{\"message\":{\"content\":\"b\"}}\n",
        );
        let out = drain_complete_lines(&mut buf);
        assert_eq!(out.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_skips_blank_lines() {
        let mut buf = String::from("\n\n{\"done\":true}\n");
        let out = drain_complete_lines(&mut buf);
        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap().done);
    }

    #[test]
    fn drain_strips_carriage_returns() {
        let mut buf = String::from("{\"done\":true}\r\n");
        let out = drain_complete_lines(&mut buf);
        assert!(out[0].as_ref().unwrap().done);
    }

    #[test]
    fn drain_reports_malformed_line_as_stream_error() {
        let mut buf = String::from("not json\n");
        let out = drain_complete_lines(&mut buf);
        assert!(matches!(out[0], Err(BackendError::Stream(_))));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let b = OllamaBackend::new("http://localhost:11434/");
        assert_eq!(b.url("/api/chat"), "http://localhost:11434/api/chat");
    }
}
