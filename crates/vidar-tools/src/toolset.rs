// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Mode → allowed-tool-set mapping.
//!
//! The mapping is a closed enumeration: a mode exposes exactly the names
//! listed here, and parsed calls to anything else are dropped before
//! dispatch.

use tracing::debug;
use vidar_config::AgentMode;

use crate::tool::ToolCall;

/// The read-only tool set shared by the exploration modes.
pub const READ_ONLY_TOOLS: [&str; 12] = [
    "read_file",
    "read_lines",
    "list_dir",
    "project_tree",
    "search",
    "grep",
    "glob",
    "find_definition",
    "find_references",
    "hover",
    "document_symbols",
    "diagnostics",
];

const REVIEW_TOOLS: [&str; 13] = with_extra(READ_ONLY_TOOLS, "terminal");
const DEEP_EXPLORE_TOOLS: [&str; 13] = with_extra(READ_ONLY_TOOLS, "run_subagent");
const DEEP_EXPLORE_WRITE_TOOLS: [&str; 14] = {
    let mut out = [""; 14];
    let mut i = 0;
    while i < 13 {
        out[i] = DEEP_EXPLORE_TOOLS[i];
        i += 1;
    }
    out[13] = "write_file";
    out
};
/// The orchestrator mode delegates all reading to sub-agents.
const AGENT_TOOLS: [&str; 3] = ["write_file", "terminal", "run_subagent"];

const fn with_extra(base: [&'static str; 12], extra: &'static str) -> [&'static str; 13] {
    let mut out = [""; 13];
    let mut i = 0;
    while i < 12 {
        out[i] = base[i];
        i += 1;
    }
    out[12] = extra;
    out
}

/// The exact tool names available in `mode`.
pub fn allowed_tools(mode: AgentMode) -> &'static [&'static str] {
    match mode {
        AgentMode::Explore | AgentMode::Plan | AgentMode::Chat => &READ_ONLY_TOOLS,
        AgentMode::Review => &REVIEW_TOOLS,
        AgentMode::DeepExplore => &DEEP_EXPLORE_TOOLS,
        AgentMode::DeepExploreWrite => &DEEP_EXPLORE_WRITE_TOOLS,
        AgentMode::Agent => &AGENT_TOOLS,
    }
}

pub fn is_allowed(mode: AgentMode, tool: &str) -> bool {
    allowed_tools(mode).contains(&tool)
}

/// Split parsed calls into allowed and dropped sets for `mode`.  Dropped
/// calls are logged — the model asked for a tool its mode does not have.
pub fn filter_calls(mode: AgentMode, calls: Vec<ToolCall>) -> (Vec<ToolCall>, Vec<ToolCall>) {
    let (kept, dropped): (Vec<_>, Vec<_>) = calls
        .into_iter()
        .partition(|c| is_allowed(mode, &c.name));
    for c in &dropped {
        debug!(mode = %mode, tool = %c.name, "dropping tool call not allowed in mode");
    }
    (kept, dropped)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
