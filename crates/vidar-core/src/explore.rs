// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Read-only sub-agent runs.
//!
//! A sub-agent is the same loop engine in a quarantined, read-only
//! configuration: its stream/thinking/final events never reach the sink
//! (only tool actions, inside one wrapper progress group), and its result
//! re-enters the parent loop as tool output.

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vidar_config::{AgentMode, SessionOptions};
use vidar_tools::{ToolCall, ToolResult};

use crate::agent::{AgentDeps, AgentLoop, LoopConfig, LoopOutcome};
use crate::events::{EventBus, UiEvent};
use crate::session::{Session, SessionStatus};
use crate::store::SessionStore;

/// Thinking dump cap when a sub-agent produced no text.
const THINKING_CAP: usize = 4_000;
/// Per-tool cap in the tool-results fallback summary.
const PER_TOOL_CAP: usize = 4_000;
/// Total cap of the tool-results fallback summary.
const TOTAL_CAP: usize = 8_000;

/// Tools whose output is worth quoting in the fallback summary.
const DATA_BEARING_TOOLS: [&str; 8] = [
    "read_file",
    "read_lines",
    "search",
    "grep",
    "glob",
    "find_definition",
    "find_references",
    "document_symbols",
];

#[derive(Debug, Clone)]
pub struct ExploreRequest {
    pub task: String,
    pub mode: AgentMode,
    pub title: String,
    pub context_hint: Option<String>,
}

impl ExploreRequest {
    /// Parse the `run_subagent(task, mode, title, context_hint, description)`
    /// pseudo-tool arguments.  Modes outside the read-only set clamp to
    /// `explore` — a sub-agent never writes.
    pub fn from_call(call: &ToolCall) -> Option<Self> {
        let task = call.str_arg("task")?.to_string();
        let mode = match call.str_arg("mode") {
            Some("plan") => AgentMode::Plan,
            Some("chat") => AgentMode::Chat,
            _ => AgentMode::Explore,
        };
        let title = call
            .str_arg("title")
            .map(|t| t.to_string())
            .unwrap_or_else(|| {
                let t: String = task.chars().take(48).collect();
                t
            });
        Some(Self {
            task,
            mode,
            title,
            context_hint: call.str_arg("context_hint").map(|s| s.to_string()),
        })
    }
}

/// Run one sub-agent and synthesize its result for the parent.
pub async fn run_explore(
    deps: AgentDeps,
    workspace: PathBuf,
    parent_session_id: &str,
    request: ExploreRequest,
    cancel: CancellationToken,
) -> anyhow::Result<String> {
    let bus = EventBus::new(parent_session_id, deps.store.clone(), deps.sink.clone());
    bus.emit(UiEvent::StartProgressGroup {
        title: request.title.clone(),
    })
    .await;

    let task = match &request.context_hint {
        Some(hint) => format!("{}\n\nContext from the orchestrator:\n{hint}", request.task),
        None => request.task.clone(),
    };
    let sub_id = deps
        .store
        .create_session(&task, &deps.config.model.name, &workspace)
        .await?;
    let mut session = Session::new(
        task,
        request.mode,
        deps.config.model.name.clone(),
        workspace,
        SessionOptions::default(),
    );
    session.id = sub_id;

    let cfg = LoopConfig::subagent(request.mode, &deps.config);
    let mut agent = AgentLoop::new(session, deps.clone(), cfg, None);
    let outcome = agent.run(cancel).await;

    bus.emit(UiEvent::FinishProgressGroup).await;

    let outcome = outcome?;
    debug!(
        status = %outcome.status,
        iterations = outcome.iterations,
        "sub-agent finished"
    );
    if outcome.status == SessionStatus::Error {
        anyhow::bail!("sub-agent failed: {}", outcome.final_text);
    }
    Ok(synthesize_output(&outcome))
}

/// The sub-agent's answer for the parent: accumulated model text, else a
/// capped thinking dump, else whatever its data-bearing tools returned.
pub(crate) fn synthesize_output(outcome: &LoopOutcome) -> String {
    let text = outcome.streamed_text.trim();
    if !text.is_empty() {
        return text.to_string();
    }
    let thinking = outcome.thinking.trim();
    if !thinking.is_empty() {
        return cap_chars(thinking, THINKING_CAP);
    }
    build_tool_results_summary(&outcome.tool_outputs)
}

fn build_tool_results_summary(tool_outputs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, output) in tool_outputs {
        if !DATA_BEARING_TOOLS.contains(&name.as_str()) {
            continue;
        }
        let chunk = format!("[{name}]\n{}\n\n", cap_chars(output.trim(), PER_TOOL_CAP));
        if out.len() + chunk.len() > TOTAL_CAP {
            let remaining = TOTAL_CAP.saturating_sub(out.len());
            out.push_str(&cap_chars(&chunk, remaining));
            break;
        }
        out.push_str(&chunk);
    }
    if out.trim().is_empty() {
        "(sub-agent produced no output)".to_string()
    } else {
        out.trim_end().to_string()
    }
}

fn cap_chars(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Build the opaque callback the dispatcher invokes for `run_subagent`
/// calls.  The engine itself never learns what is behind it.
pub fn make_subagent_runner(
    deps: AgentDeps,
    workspace: PathBuf,
    parent_session_id: String,
) -> crate::dispatch::SubAgentRunner {
    Arc::new(move |call: ToolCall, cancel: CancellationToken| {
        let deps = deps.clone();
        let workspace = workspace.clone();
        let parent = parent_session_id.clone();
        async move {
            let Some(request) = ExploreRequest::from_call(&call) else {
                return ToolResult::err("run_subagent requires a 'task' argument");
            };
            match run_explore(deps, workspace, &parent, request, cancel).await {
                Ok(summary) => ToolResult::ok(summary),
                Err(e) => ToolResult::err(format!("sub-agent error: {e}")),
            }
        }
        .boxed()
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(text: &str, thinking: &str, tools: Vec<(&str, &str)>) -> LoopOutcome {
        LoopOutcome {
            status: SessionStatus::Completed,
            final_text: String::new(),
            files_changed: vec![],
            iterations: 1,
            streamed_text: text.to_string(),
            thinking: thinking.to_string(),
            tool_outputs: tools
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    #[test]
    fn request_parses_all_fields() {
        let call = ToolCall::from_value(
            "run_subagent",
            json!({
                "task": "find the config loader",
                "mode": "plan",
                "title": "Find loader",
                "context_hint": "it is YAML based"
            }),
        );
        let r = ExploreRequest::from_call(&call).unwrap();
        assert_eq!(r.mode, AgentMode::Plan);
        assert_eq!(r.title, "Find loader");
        assert_eq!(r.context_hint.as_deref(), Some("it is YAML based"));
    }

    #[test]
    fn request_requires_task() {
        let call = ToolCall::from_value("run_subagent", json!({"mode": "explore"}));
        assert!(ExploreRequest::from_call(&call).is_none());
    }

    #[test]
    fn unknown_mode_clamps_to_explore() {
        let call = ToolCall::from_value(
            "run_subagent",
            json!({"task": "x", "mode": "agent"}),
        );
        let r = ExploreRequest::from_call(&call).unwrap();
        assert_eq!(r.mode, AgentMode::Explore);
    }

    #[test]
    fn missing_title_derives_from_task() {
        let call = ToolCall::from_value("run_subagent", json!({"task": "inspect the parser"}));
        let r = ExploreRequest::from_call(&call).unwrap();
        assert_eq!(r.title, "inspect the parser");
    }

    #[test]
    fn synthesis_prefers_streamed_text() {
        let o = outcome("the answer", "some thinking", vec![("read_file", "data")]);
        assert_eq!(synthesize_output(&o), "the answer");
    }

    #[test]
    fn synthesis_falls_back_to_thinking() {
        let o = outcome("", "reasoned through it", vec![("read_file", "data")]);
        assert_eq!(synthesize_output(&o), "reasoned through it");
    }

    #[test]
    fn thinking_dump_is_capped() {
        let long = "t".repeat(10_000);
        let o = outcome("", &long, vec![]);
        let s = synthesize_output(&o);
        assert!(s.len() <= THINKING_CAP + '…'.len_utf8());
    }

    #[test]
    fn synthesis_last_resort_is_tool_results() {
        let o = outcome(
            "",
            "",
            vec![("read_file", "file body"), ("terminal", "should not appear")],
        );
        let s = synthesize_output(&o);
        assert!(s.contains("[read_file]\nfile body"));
        assert!(!s.contains("should not appear"));
    }

    #[test]
    fn tool_results_summary_caps_total() {
        let big = "x".repeat(5_000);
        let o = outcome(
            "",
            "",
            vec![("read_file", big.as_str()), ("search", big.as_str()), ("grep", big.as_str())],
        );
        let s = synthesize_output(&o);
        assert!(s.len() <= TOTAL_CAP + 8);
    }

    #[test]
    fn empty_everything_yields_placeholder() {
        let o = outcome("", "", vec![]);
        assert_eq!(synthesize_output(&o), "(sub-agent produced no output)");
    }
}
