// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::tool::{Tool, ToolCall, ToolKind, ToolResult};

/// A tool schema entry handed to the model request builder.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Execution kind of a registered tool; unknown names are `Other`.
    pub fn kind_of(&self, name: &str) -> ToolKind {
        self.tools
            .get(name)
            .map(|t| t.kind())
            .unwrap_or(ToolKind::Other)
    }

    /// All registered names — the "known tool set" consulted by the
    /// stream decoder's bare-JSON detection.
    pub fn known_names(&self) -> HashSet<String> {
        self.tools.keys().cloned().collect()
    }

    /// Schemas for the given allowed-name subset, sorted by name.
    pub fn schemas_for(&self, allowed: &[&str]) -> Vec<SchemaEntry> {
        let mut schemas: Vec<SchemaEntry> = self
            .tools
            .values()
            .filter(|t| allowed.contains(&t.name()))
            .map(|t| SchemaEntry {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a call, timing it.  Unknown tools return an error result so
    /// the model can correct itself.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let mut result = match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolResult::err(format!("unknown tool: {}", call.name)),
        };
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
