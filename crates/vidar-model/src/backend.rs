// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::types::{ChatChunk, ChatRequest, ChatResponse, ModelSummary, ShowModelResponse};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, BackendError>> + Send>>;

/// Errors from the chat backend.
///
/// `Auth` is non-retryable and must surface immediately; everything else is
/// handled by the loop's per-iteration error policy.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("server error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Streaming chat API of an Ollama-compatible server.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open a streaming chat request.  Dropping the returned stream aborts
    /// the underlying transport; `cancel` additionally interrupts the
    /// connection phase.
    async fn chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError>;

    /// One-shot non-streaming completion (title generation, fallback
    /// summaries, compaction).
    async fn chat_no_stream(&self, req: ChatRequest) -> Result<ChatResponse, BackendError>;

    async fn list_models(&self) -> Result<Vec<ModelSummary>, BackendError>;

    async fn show_model(&self, name: &str) -> Result<ShowModelResponse, BackendError>;
}
