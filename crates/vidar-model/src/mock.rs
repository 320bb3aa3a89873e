// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, ChatBackend, ChunkStream};
use crate::types::{
    ChatChunk, ChatRequest, ChatResponse, ChunkMessage, ModelSummary, ShowModelResponse,
};

/// A pre-scripted backend.  Each `chat` call pops the next chunk script from
/// the front of the queue, so tests can specify exact event sequences —
/// including tool calls and parse errors — without network access.
pub struct ScriptedMockBackend {
    scripts: Arc<Mutex<Vec<Vec<ChatChunk>>>>,
    /// Every `ChatRequest` seen, in order, so tests can inspect what was
    /// actually sent (thinking stripped, num_ctx set, …).
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
    /// Capabilities reported via `show_model`.
    pub native_tools: bool,
    pub context_length: Option<u32>,
    /// When set, every streamed script stalls (never completes) after its
    /// last chunk — models a hung server for cancellation tests.
    pub stall_after_chunks: bool,
}

impl ScriptedMockBackend {
    pub fn new(scripts: Vec<Vec<ChatChunk>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
            native_tools: true,
            context_length: Some(32_768),
            stall_after_chunks: false,
        }
    }

    /// Backend that emits `thinking` and then hangs until cancelled.
    pub fn thinking_then_stall(thinking: impl Into<String>) -> Self {
        let mut b = Self::new(vec![vec![ChatChunk::thinking(thinking)]]);
        b.stall_after_chunks = true;
        b
    }

    /// Declare the model as text-tool-calling only.
    pub fn without_native_tools(mut self) -> Self {
        self.native_tools = false;
        self
    }

    pub fn with_context_length(mut self, n: u32) -> Self {
        self.context_length = Some(n);
        self
    }

    /// Backend that always replies with a single text turn.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![ChatChunk::text(r), ChatChunk::done(10, 10)]])
    }

    /// Backend that emits one tool call, then a text reply on the next turn.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![ChatChunk::tool_call(tool_name, args), ChatChunk::done(10, 5)],
            vec![ChatChunk::text(final_text), ChatChunk::done(20, 10)],
        ])
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn pop_script(&self) -> Vec<ChatChunk> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            vec![
                ChatChunk::text("[no more scripts]"),
                ChatChunk::done(1, 1),
            ]
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedMockBackend {
    async fn chat(
        &self,
        req: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError> {
        self.requests.lock().unwrap().push(req);
        let chunks = self.pop_script();
        let wrapped: Vec<Result<ChatChunk, BackendError>> = chunks.into_iter().map(Ok).collect();
        if self.stall_after_chunks {
            use futures::StreamExt;
            return Ok(Box::pin(stream::iter(wrapped).chain(stream::pending())));
        }
        Ok(Box::pin(stream::iter(wrapped)))
    }

    async fn chat_no_stream(&self, req: ChatRequest) -> Result<ChatResponse, BackendError> {
        self.requests.lock().unwrap().push(req);
        let chunks = self.pop_script();
        let mut content = String::new();
        let mut thinking = String::new();
        for c in &chunks {
            if let Some(m) = &c.message {
                if let Some(t) = &m.content {
                    content.push_str(t);
                }
                if let Some(t) = &m.thinking {
                    thinking.push_str(t);
                }
            }
        }
        Ok(ChatResponse {
            message: ChunkMessage {
                content: Some(content),
                thinking: if thinking.is_empty() { None } else { Some(thinking) },
                tool_calls: None,
            },
            done_reason: Some("stop".into()),
            prompt_eval_count: Some(10),
            eval_count: Some(10),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelSummary>, BackendError> {
        Ok(vec![ModelSummary {
            name: "scripted-mock".into(),
            size: None,
            modified_at: None,
        }])
    }

    async fn show_model(&self, _name: &str) -> Result<ShowModelResponse, BackendError> {
        let mut capabilities = vec!["completion".to_string()];
        if self.native_tools {
            capabilities.push("tools".into());
        }
        let model_info = match self.context_length {
            Some(n) => serde_json::json!({ "mock.context_length": n }),
            None => serde_json::json!({}),
        };
        Ok(ShowModelResponse {
            capabilities,
            model_info,
            parameters: None,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
