// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model capability detection and the process-wide capability cache.
//!
//! Capabilities are read once per model from the show-model endpoint and
//! cached for the lifetime of the process.  Readers take atomic snapshots;
//! refresh goes through a single writer path.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use tracing::debug;

use crate::backend::ChatBackend;
use crate::types::ShowModelResponse;

/// Snapshot of what a model can do and how much context it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelCaps {
    /// The model supports native (structured) tool calls.
    pub native_tools: bool,
    /// Detected context window, when the server reports one.
    pub context_length: Option<u32>,
}

fn cache() -> &'static RwLock<HashMap<String, ModelCaps>> {
    static CACHE: OnceLock<RwLock<HashMap<String, ModelCaps>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Cached capabilities for `model`, if a lookup already ran this process.
pub fn cached(model: &str) -> Option<ModelCaps> {
    cache().read().ok()?.get(model).copied()
}

/// Store freshly detected capabilities.  Single-writer refresh path.
pub fn store(model: &str, caps: ModelCaps) {
    if let Ok(mut map) = cache().write() {
        map.insert(model.to_string(), caps);
    }
}

/// Resolve capabilities for `model`, consulting the cache first and the
/// backend's show-model endpoint on a miss.  A failed probe yields
/// conservative defaults (text tool-calling, unknown window) and is NOT
/// cached, so a later probe can still succeed.
pub async fn resolve(backend: &dyn ChatBackend, model: &str) -> ModelCaps {
    if let Some(caps) = cached(model) {
        return caps;
    }
    match backend.show_model(model).await {
        Ok(show) => {
            let caps = caps_from_show(&show);
            debug!(model, ?caps, "detected model capabilities");
            store(model, caps);
            caps
        }
        Err(e) => {
            debug!(model, error = %e, "capability probe failed; using defaults");
            ModelCaps::default()
        }
    }
}

pub fn caps_from_show(show: &ShowModelResponse) -> ModelCaps {
    ModelCaps {
        native_tools: show.capabilities.iter().any(|c| c == "tools"),
        context_length: extract_context_length(show),
    }
}

/// Extract the context window from a show-model response.
///
/// Lookup order:
/// 1. any `model_info` key ending in `.context_length`
///    (e.g. `llama.context_length`, `qwen2.context_length`)
/// 2. flat `context_length` / `context_window` / `num_ctx` keys
/// 3. `num_ctx <N>` parsed out of the `parameters` text blob
pub fn extract_context_length(show: &ShowModelResponse) -> Option<u32> {
    if let Some(info) = show.model_info.as_object() {
        for (key, value) in info {
            if key.ends_with(".context_length") {
                if let Some(n) = value.as_u64() {
                    return Some(n as u32);
                }
            }
        }
        for key in ["context_length", "context_window", "num_ctx"] {
            if let Some(n) = info.get(key).and_then(|v| v.as_u64()) {
                return Some(n as u32);
            }
        }
    }
    let params = show.parameters.as_deref()?;
    let re = regex::Regex::new(r"\bnum_ctx\s+(\d+)").ok()?;
    re.captures(params)?
        .get(1)?
        .as_str()
        .parse::<u32>()
        .ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
