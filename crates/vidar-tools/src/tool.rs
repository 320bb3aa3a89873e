// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    /// Loosely-typed argument map — the model emits these as JSON, so each
    /// tool validates its own argument shape at its boundary.
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Build a call from any JSON value; non-object arguments become an
    /// empty map (model providers require an object here).
    pub fn from_value(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Self::new(name, args)
    }

    /// Duplicate-detection signature: `name|key=value|key=value…` with keys
    /// sorted so argument order never changes the signature.
    pub fn signature(&self) -> String {
        let sorted: BTreeMap<&String, &Value> = self.args.iter().collect();
        let mut sig = self.name.clone();
        for (k, v) in sorted {
            sig.push('|');
            sig.push_str(k);
            sig.push('=');
            sig.push_str(&v.to_string());
        }
        sig
    }

    /// String argument accessor.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Deterministic JSON serialisation of an argument map (keys sorted), used
/// as the tool-result cache key.
pub fn stable_args_json(args: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = args.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// The result of executing a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Output fed back to the model (and shown in the UI action).
    pub output: String,
    /// Non-fatal failure message; the loop continues and the model sees it.
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            output: msg.clone(),
            error: Some(msg),
            elapsed_ms: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Execution class of a tool — drives approval routing, scheduling bucket,
/// and result caching in the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Shell command execution; approval-gated by command severity.
    Terminal,
    /// File write/create/delete; approval-gated on sensitive paths and
    /// snapshotted into the checkpoint before the write.
    FileEdit,
    /// File read; executed as a chunked stream with per-chunk UI actions.
    ReadFile,
    /// Delegates to a model-calling sub-agent; always scheduled serially.
    SubAgent,
    /// Pure read-only query (search, listing, LSP); results are cacheable.
    ReadOnly,
    /// Anything else; runs in the parallel bucket, uncached.
    Other,
}

impl ToolKind {
    /// Results of this kind may be served from the per-turn cache.
    pub fn cacheable(&self) -> bool {
        matches!(self, ToolKind::ReadOnly)
    }

    /// This kind must run one call at a time.
    pub fn serial(&self) -> bool {
        matches!(self, ToolKind::SubAgent)
    }
}

/// Trait implemented by every named effectful operation in the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;
    fn kind(&self) -> ToolKind;
    /// Execute the tool.  Failures should be wrapped in [`ToolResult::err`].
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
