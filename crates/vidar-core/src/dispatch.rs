// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Batch tool execution: routing, approval, caching, enrichment.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::BoxFuture;
use lru::LruCache;
use serde_json::{json, Value};
use similar::TextDiff;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use vidar_config::SessionOptions;
use vidar_tools::{
    analyze_command, requires_approval, stable_args_json, Severity, ToolCall, ToolKind,
    ToolRegistry, ToolResult,
};

use crate::approval::{ApprovalGate, ApprovalKind, ApprovalRequest};
use crate::checkpoint::CheckpointManager;
use crate::compact::smart_truncate;
use crate::events::{ActionStatus, EventBus, UiEvent};
use crate::host::{error_diagnostics, HostEnvironment};

/// Hard cap on one batch; anything beyond is dropped with a warning note.
const BATCH_HARD_CAP: usize = 15;
/// Above this, the model gets a "consider fewer tools" hint.
const BATCH_HINT_THRESHOLD: usize = 8;
/// Result-cache capacity per agent turn.
const CACHE_CAPACITY: usize = 256;
/// How long to wait for host diagnostics after a write.
const DIAGNOSTICS_WAIT_MS: u64 = 3_000;
/// Lines per UI chunk when surfacing a file read.
const READ_CHUNK_LINES: usize = 400;

pub const DENIAL_HINT: &str =
    "[SYSTEM NOTE: This action was denied by the user. Do NOT re-attempt the same call.]";

/// Name of the sub-agent pseudo-tool.  It never appears in the registry —
/// the dispatcher routes it to the injected runner.
pub const SUBAGENT_TOOL: &str = "run_subagent";

pub type SubAgentRunner =
    Arc<dyn Fn(ToolCall, CancellationToken) -> BoxFuture<'static, ToolResult> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub call: ToolCall,
    pub result: ToolResult,
    pub skipped: bool,
    pub cached: bool,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// One entry per surviving call, in the original batch order.
    pub executed: Vec<ExecutedCall>,
    pub wrote_files: Vec<String>,
    pub ran_terminal: bool,
    /// Warnings to inject as ephemeral system notes.
    pub notes: Vec<String>,
}

impl DispatchOutcome {
    /// Native-mode shape: one `(tool_name, content)` per call.
    pub fn native_results(&self) -> Vec<(String, String)> {
        self.executed
            .iter()
            .map(|e| (e.call.name.clone(), e.result.output.clone()))
            .collect()
    }

    /// Text-mode shape: labelled blocks for one combined user message.
    pub fn text_results(&self) -> Vec<String> {
        self.executed
            .iter()
            .map(|e| format!("[{} result]\n{}", e.call.name, e.result.output))
            .collect()
    }
}

enum Plan {
    Execute,
    Cached(String),
    Skip(String),
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    host: Arc<dyn HostEnvironment>,
    bus: EventBus,
    checkpoint: Option<Arc<CheckpointManager>>,
    options: SessionOptions,
    subagent: Option<SubAgentRunner>,
    cache: Mutex<LruCache<String, String>>,
    tool_result_cap: usize,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<ApprovalGate>,
        host: Arc<dyn HostEnvironment>,
        bus: EventBus,
        checkpoint: Option<Arc<CheckpointManager>>,
        options: SessionOptions,
        subagent: Option<SubAgentRunner>,
        tool_result_cap: usize,
    ) -> Self {
        Self {
            registry,
            gate,
            host,
            bus,
            checkpoint,
            options,
            subagent,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            tool_result_cap,
        }
    }

    pub async fn execute_batch(
        &self,
        mut calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        // Over-eager mitigation.
        if calls.len() > BATCH_HARD_CAP {
            let dropped = calls.len() - BATCH_HARD_CAP;
            calls.truncate(BATCH_HARD_CAP);
            outcome.notes.push(format!(
                "Tool batch exceeded the limit; {dropped} call(s) were dropped. \
                 Issue at most {BATCH_HARD_CAP} targeted calls per iteration."
            ));
        } else if calls.len() > BATCH_HINT_THRESHOLD {
            outcome.notes.push(format!(
                "Large tool batch ({} calls). Consider fewer, more targeted tools per iteration.",
                calls.len()
            ));
        }

        // Phase 1: routing — approvals, cache lookups, snapshots.  Runs in
        // call order so the user sees prompts in the order the model asked.
        let mut plans: Vec<Plan> = Vec::with_capacity(calls.len());
        for call in calls.iter_mut() {
            let plan = self.plan_call(call, cancel).await;
            plans.push(plan);
        }

        // Phase 2: execution — parallel for local tools, serial for
        // model-calling ones.  Results merge back in original order.
        let mut results: Vec<Option<ExecutedCall>> = Vec::with_capacity(calls.len());
        results.resize_with(calls.len(), || None);

        let mut parallel: Vec<(usize, tokio::task::JoinHandle<ToolResult>)> = Vec::new();
        let mut serial: Vec<usize> = Vec::new();

        for (i, (call, plan)) in calls.iter().zip(plans.iter()).enumerate() {
            match plan {
                Plan::Skip(output) => {
                    results[i] = Some(ExecutedCall {
                        call: call.clone(),
                        result: ToolResult::err(output.clone()),
                        skipped: true,
                        cached: false,
                    });
                }
                Plan::Cached(output) => {
                    results[i] = Some(ExecutedCall {
                        call: call.clone(),
                        result: ToolResult::ok(output.clone()),
                        skipped: false,
                        cached: true,
                    });
                }
                Plan::Execute => {
                    let kind = self.kind_for(&call.name);
                    // File reads emit their running/success pairs per chunk
                    // in finish_ui instead of one up-front running action.
                    if kind != ToolKind::ReadFile {
                        self.action_event(call, ActionStatus::Running, None).await;
                    }
                    if kind.serial() {
                        serial.push(i);
                    } else {
                        let registry = Arc::clone(&self.registry);
                        let call = call.clone();
                        parallel.push((
                            i,
                            tokio::spawn(async move { registry.execute(&call).await }),
                        ));
                    }
                }
            }
        }

        for i in serial {
            if cancel.is_cancelled() {
                results[i] = Some(ExecutedCall {
                    call: calls[i].clone(),
                    result: ToolResult::err("Cancelled before execution."),
                    skipped: true,
                    cached: false,
                });
                continue;
            }
            let result = match &self.subagent {
                Some(runner) => runner(calls[i].clone(), cancel.clone()).await,
                None => ToolResult::err("sub-agent delegation is not available here"),
            };
            results[i] = Some(ExecutedCall {
                call: calls[i].clone(),
                result,
                skipped: false,
                cached: false,
            });
        }

        for (i, task) in parallel {
            let result = match task.await {
                Ok(r) => r,
                Err(e) => ToolResult::err(format!("tool execution panicked: {e}")),
            };
            results[i] = Some(ExecutedCall {
                call: calls[i].clone(),
                result,
                skipped: false,
                cached: false,
            });
        }

        // Phase 3: enrichment + UI completion, in original order.
        for executed in results.into_iter().flatten() {
            let executed = self.enrich(executed, &mut outcome).await;
            self.finish_ui(&executed).await;
            outcome.executed.push(executed);
        }

        outcome
    }

    /// The sub-agent pseudo-tool has no registry entry; everything else
    /// takes its registered kind.
    fn kind_for(&self, name: &str) -> ToolKind {
        if name == SUBAGENT_TOOL {
            ToolKind::SubAgent
        } else {
            self.registry.kind_of(name)
        }
    }

    /// Classify one call and decide how it runs.
    async fn plan_call(&self, call: &mut ToolCall, cancel: &CancellationToken) -> Plan {
        match self.kind_for(&call.name) {
            ToolKind::Terminal => {
                let command = call.str_arg("command").unwrap_or("").to_string();
                let severity = analyze_command(&command);
                if requires_approval(severity, self.options.auto_approve_commands) {
                    let request = ApprovalRequest::new(
                        ApprovalKind::Terminal,
                        json!({ "command": command }),
                        severity,
                    );
                    let response = self.gate.request(&self.bus, request, cancel).await;
                    if !response.approved {
                        return Plan::Skip(format!("Skipped by user.\n{DENIAL_HINT}"));
                    }
                    if let Some(revised) = response.revised_command {
                        call.args
                            .insert("command".into(), Value::String(revised));
                    }
                }
                Plan::Execute
            }
            ToolKind::FileEdit => {
                let path = call.str_arg("path").unwrap_or("").to_string();
                if self.is_sensitive(&path) && !self.options.auto_approve_sensitive_edits {
                    let request = ApprovalRequest::new(
                        ApprovalKind::FileEdit,
                        json!({ "path": path.clone() }),
                        Severity::High,
                    );
                    let response = self.gate.request(&self.bus, request, cancel).await;
                    if !response.approved {
                        return Plan::Skip(format!("Skipped by user.\n{DENIAL_HINT}"));
                    }
                }
                // Snapshot precedes the write that triggers it.  The
                // checkpoint memoizes per path, so the diff pass can ask
                // again later and still see the pre-turn content.
                if let Some(cp) = &self.checkpoint {
                    if let Err(e) = cp.snapshot_before_write(self.host.as_ref(), &path).await {
                        debug!(path, error = %e, "checkpoint snapshot failed");
                    }
                }
                Plan::Execute
            }
            kind if kind.cacheable() => {
                let key = cache_key(call);
                if let Some(hit) = self.cache.lock().await.get(&key).cloned() {
                    debug!(tool = %call.name, "tool cache hit");
                    self.action_event(call, ActionStatus::Success, Some("cached"))
                        .await;
                    return Plan::Cached(hit);
                }
                Plan::Execute
            }
            _ => Plan::Execute,
        }
    }

    fn is_sensitive(&self, path: &str) -> bool {
        self.options
            .sensitive_file_patterns
            .iter()
            .any(|p| glob_match(p, path))
    }

    /// Post-execution enrichment: diff stats, diagnostics, reminders,
    /// cache population/invalidation, bookkeeping.
    async fn enrich(&self, mut executed: ExecutedCall, outcome: &mut DispatchOutcome) -> ExecutedCall {
        let kind = self.kind_for(&executed.call.name);

        if executed.skipped {
            return executed;
        }

        match kind {
            ToolKind::FileEdit if !executed.result.is_error() => {
                let path = executed.call.str_arg("path").unwrap_or("").to_string();
                outcome.wrote_files.push(path.clone());

                // +adds/−dels against the checkpoint snapshot.
                let original = match &self.checkpoint {
                    Some(cp) => cp
                        .snapshot_before_write(self.host.as_ref(), &path)
                        .await
                        .ok()
                        .flatten(),
                    None => None,
                };
                if let Ok(new_content) = self.host.read_file(&path).await {
                    let old = original.unwrap_or_default();
                    let diff = TextDiff::from_lines(&old, &new_content);
                    let adds = diff
                        .iter_all_changes()
                        .filter(|c| c.tag() == similar::ChangeTag::Insert)
                        .count();
                    let dels = diff
                        .iter_all_changes()
                        .filter(|c| c.tag() == similar::ChangeTag::Delete)
                        .count();
                    executed
                        .result
                        .output
                        .push_str(&format!("\n(+{adds}/-{dels})"));
                }

                // A write invalidates every cached result that mentions the path.
                let mut cache = self.cache.lock().await;
                let stale: Vec<String> = cache
                    .iter()
                    .filter(|(k, _)| k.contains(&path))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in stale {
                    cache.pop(&k);
                }
                drop(cache);

                // Surface fresh diagnostics inline so the model fixes its
                // own breakage before declaring completion.
                let diags = self
                    .host
                    .wait_for_diagnostics(&path, DIAGNOSTICS_WAIT_MS)
                    .await;
                let errors = error_diagnostics(&diags);
                if !errors.is_empty() {
                    executed.result.output.push_str("\n[AUTO-DIAGNOSTICS]");
                    for d in errors {
                        executed
                            .result
                            .output
                            .push_str(&format!("\n- line {}: {}", d.line, d.message));
                    }
                }
            }
            ToolKind::Terminal if !executed.result.is_error() => {
                outcome.ran_terminal = true;
                if executed.result.output.contains("[exit code:") {
                    executed.result.output.push_str(
                        "\n[Note: the command exited non-zero — inspect the output \
                         before proceeding]",
                    );
                }
            }
            kind if kind.cacheable() && !executed.result.is_error() && !executed.cached => {
                self.cache
                    .lock()
                    .await
                    .put(cache_key(&executed.call), executed.result.output.clone());
            }
            _ => {}
        }

        // Contextual reminders keep the model from misreading silence.
        if !executed.result.is_error() && executed.result.output.trim().is_empty() {
            executed.result.output = match kind {
                ToolKind::ReadFile => "[Note: the file is empty]".to_string(),
                _ => "[Note: the tool produced no output]".to_string(),
            };
        }

        // Bound what a single result may occupy in the session.
        executed.result.output =
            smart_truncate(&executed.result.output, kind, self.tool_result_cap);

        executed
    }

    async fn finish_ui(&self, executed: &ExecutedCall) {
        if executed.cached {
            // The cached success event was already emitted during planning.
            return;
        }
        let kind = self.kind_for(&executed.call.name);
        let status = if executed.result.is_error() {
            ActionStatus::Error
        } else {
            ActionStatus::Success
        };

        // File reads surface as one running/success pair per chunk so a
        // long file shows progress rather than a single long stall.
        if kind == ToolKind::ReadFile && status == ActionStatus::Success {
            let lines = executed.result.output.lines().count();
            let chunks = lines.div_ceil(READ_CHUNK_LINES).max(1);
            for part in 1..=chunks {
                let suffix = if chunks > 1 {
                    Some(format!("part {part}/{chunks}"))
                } else {
                    None
                };
                self.action_event(&executed.call, ActionStatus::Running, suffix.as_deref())
                    .await;
                self.action_event(&executed.call, ActionStatus::Success, suffix.as_deref())
                    .await;
            }
            return;
        }

        self.action_event(&executed.call, status, None).await;
    }

    /// Persist-first tool action event.
    async fn action_event(&self, call: &ToolCall, status: ActionStatus, suffix: Option<&str>) {
        let mut title = action_title(call);
        if let Some(s) = suffix {
            title.push_str(&format!(" ({s})"));
        }
        self.bus
            .emit(UiEvent::ShowToolAction {
                id: Uuid::new_v4().to_string(),
                tool: call.name.clone(),
                title,
                status,
            })
            .await;
    }
}

fn cache_key(call: &ToolCall) -> String {
    format!("{}:{}", call.name, stable_args_json(&call.args))
}

fn action_title(call: &ToolCall) -> String {
    if let Some(path) = call.str_arg("path") {
        return format!("{} {}", call.name, path);
    }
    if let Some(command) = call.str_arg("command") {
        return command.to_string();
    }
    if let Some(query) = call.str_arg("query") {
        return format!("{} \"{}\"", call.name, query);
    }
    if let Some(title) = call.str_arg("title") {
        return title.to_string();
    }
    call.name.clone()
}

/// Minimal glob matching: `*` spans within a path segment boundary freely,
/// `**/` spans directories.
fn glob_match(pattern: &str, path: &str) -> bool {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    match regex::Regex::new(&re) {
        Ok(re) => {
            // Patterns without a directory component match on the basename.
            let candidate = if pattern.contains('/') {
                path
            } else {
                path.rsplit('/').next().unwrap_or(path)
            };
            re.is_match(candidate)
        }
        Err(_) => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_extension_patterns() {
        assert!(glob_match("*.env", "prod.env"));
        assert!(glob_match("*.env", "config/prod.env"));
        assert!(!glob_match("*.env", "env.rs"));
    }

    #[test]
    fn glob_matches_prefix_patterns() {
        assert!(glob_match(".env*", ".env.local"));
        assert!(glob_match(".env*", ".env"));
    }

    #[test]
    fn glob_double_star_spans_directories() {
        assert!(glob_match("**/secrets/**", "config/secrets/prod.yaml"));
        assert!(!glob_match("**/secrets/**", "config/public/prod.yaml"));
    }

    #[test]
    fn glob_exact_name() {
        assert!(glob_match("Cargo.lock", "Cargo.lock"));
        assert!(glob_match("Cargo.lock", "sub/Cargo.lock"));
        assert!(!glob_match("Cargo.lock", "Cargo.toml"));
    }

    #[test]
    fn cache_key_is_stable_across_arg_order() {
        let a = ToolCall::from_value("grep", serde_json::json!({"a": 1, "b": 2}));
        let b = ToolCall::from_value("grep", serde_json::json!({"b": 2, "a": 1}));
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn action_title_prefers_path_then_command() {
        let c = ToolCall::from_value("read_file", serde_json::json!({"path": "a.rs"}));
        assert_eq!(action_title(&c), "read_file a.rs");
        let c = ToolCall::from_value("terminal", serde_json::json!({"command": "ls -la"}));
        assert_eq!(action_title(&c), "ls -la");
        let c = ToolCall::from_value("grep", serde_json::json!({"query": "todo"}));
        assert_eq!(action_title(&c), "grep \"todo\"");
    }
}
