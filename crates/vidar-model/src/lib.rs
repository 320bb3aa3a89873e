// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod backend;
pub mod capability;
mod mock;
mod ollama;
mod types;

pub use backend::{BackendError, ChatBackend, ChunkStream};
pub use capability::{ModelCaps, extract_context_length};
pub use mock::ScriptedMockBackend;
pub use ollama::OllamaBackend;
pub use types::{
    ChatChunk, ChatMessage, ChatOptions, ChatRequest, ChatResponse, ChunkMessage, ModelSummary,
    Role, ShowModelResponse, ToolSpec, ToolSpecFunction, WireFunction, WireToolCall,
};
