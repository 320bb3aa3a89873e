// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-iteration agent state machine.
//!
//! One engine drives both the orchestrator and the read-only sub-agent;
//! the differences are captured in [`LoopConfig`] rather than a type
//! hierarchy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vidar_config::{AgentMode, Config};
use vidar_model::{
    capability, BackendError, ChatBackend, ChatOptions, ChatRequest, ToolSpec,
};
use vidar_tools::{toolset, ToolCall, ToolRegistry};

use crate::approval::ApprovalGate;
use crate::budget::ContextBudgeter;
use crate::checkpoint::CheckpointManager;
use crate::compact::compact_history;
use crate::control::{ControlPacket, ControlState};
use crate::dispatch::{SubAgentRunner, ToolDispatcher};
use crate::events::{ActionStatus, EventBus, UiEvent, UiSink};
use crate::history::ConversationHistory;
use crate::host::{error_diagnostics, HostEnvironment};
use crate::memory::{IterationSummary, SessionMemory};
use crate::prompts::system_prompt;
use crate::recover::recover_tool_call;
use crate::session::{Session, SessionStatus};
use crate::store::{AddMessage, SessionPatch, SessionStore};
use crate::stream::StreamDecoder;
use crate::summary::{build_final_summary, SummaryInput};
use crate::textcalls::{
    contains_completion_sentinel, extract_text_tool_calls, strip_completion_sentinel,
};

/// Largest batch the loop will dispatch in one iteration.
const BATCH_CAP: usize = 10;
/// Text-only iterations tolerated before the loop ends on its own.
const MAX_CONSECUTIVE_NO_TOOL: u32 = 3;
/// A duplicate signature seen within this many iterations is dropped.
const DUP_WINDOW: u32 = 2;
/// Signatures older than this are evicted.
const SIG_RETENTION: u32 = 3;

/// External collaborators of one agent task.
#[derive(Clone)]
pub struct AgentDeps {
    pub backend: Arc<dyn ChatBackend>,
    pub registry: Arc<ToolRegistry>,
    pub host: Arc<dyn HostEnvironment>,
    pub store: Arc<dyn SessionStore>,
    pub sink: Arc<dyn UiSink>,
    pub gate: Arc<ApprovalGate>,
    pub config: Arc<Config>,
}

/// The capability record distinguishing loop variants.
#[derive(Clone)]
pub struct LoopConfig {
    pub mode: AgentMode,
    pub max_iterations: u32,
    /// Suppress stream/thinking/final events from the sink (sub-agents).
    pub quarantined: bool,
    /// System prompt override for this run.
    pub prompt_override: Option<String>,
}

impl LoopConfig {
    pub fn orchestrator(mode: AgentMode, config: &Config) -> Self {
        Self {
            mode,
            max_iterations: config.agent.max_iterations,
            quarantined: false,
            prompt_override: config.agent.system_prompt.clone(),
        }
    }

    pub fn subagent(mode: AgentMode, config: &Config) -> Self {
        Self {
            mode,
            max_iterations: config.agent.subagent_max_iterations,
            quarantined: true,
            prompt_override: None,
        }
    }
}

#[derive(Debug)]
pub struct LoopOutcome {
    pub status: SessionStatus,
    pub final_text: String,
    pub files_changed: Vec<String>,
    pub iterations: u32,
    /// Everything the model said (streamed text), for sub-agent synthesis.
    pub streamed_text: String,
    /// Accumulated thinking across iterations.
    pub thinking: String,
    /// `(tool, output)` per executed call, in order.
    pub tool_outputs: Vec<(String, String)>,
}

enum NoToolDecision {
    BreakImplicit,
    BreakConsecutive,
    Continue(&'static str),
}

pub struct AgentLoop {
    session: Session,
    deps: AgentDeps,
    cfg: LoopConfig,
    subagent: Option<SubAgentRunner>,
}

impl AgentLoop {
    pub fn new(
        session: Session,
        deps: AgentDeps,
        cfg: LoopConfig,
        subagent: Option<SubAgentRunner>,
    ) -> Self {
        Self {
            session,
            deps,
            cfg,
            subagent,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the loop to completion, cancellation, iteration cap, or fatal
    /// error.  Every exit runs the finalize path.
    pub async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<LoopOutcome> {
        let deps = self.deps.clone();
        let mode = self.cfg.mode;
        let model = self.session.model.clone();
        let session_id = self.session.id.clone();

        let mut bus = EventBus::new(session_id.as_str(), deps.store.clone(), deps.sink.clone());
        if self.cfg.quarantined {
            bus = bus.quarantined();
        }

        let _ = deps
            .store
            .update_session(
                &session_id,
                SessionPatch {
                    status: Some(SessionStatus::Generating),
                    ..Default::default()
                },
            )
            .await;

        let caps = capability::resolve(deps.backend.as_ref(), &model).await;
        let native = caps.native_tools;
        let mut budgeter = ContextBudgeter::new(
            caps.context_length,
            deps.config.model.context_length,
            deps.config.context.global_cap,
            deps.config.model.num_predict.unwrap_or(4096),
            deps.config.context.compaction_threshold,
        );

        let allowed = toolset::allowed_tools(mode);
        let known_tools: HashSet<String> = allowed.iter().map(|s| s.to_string()).collect();
        let prompt = system_prompt(
            mode,
            self.cfg.prompt_override.as_deref(),
            &self.session.workspace.to_string_lossy(),
            allowed,
        );
        let mut history = ConversationHistory::new(prompt, native);
        history.push_user(self.session.task.clone());

        let checkpoint = if mode.allows_writes() {
            Some(Arc::new(
                CheckpointManager::create(deps.store.clone(), &session_id).await?,
            ))
        } else {
            None
        };

        let dispatcher = ToolDispatcher::new(
            deps.registry.clone(),
            deps.gate.clone(),
            deps.host.clone(),
            bus.clone(),
            checkpoint.clone(),
            self.session.options.clone(),
            self.subagent.clone(),
            deps.config.agent.tool_result_token_cap,
        );

        let mut memory = SessionMemory::new();
        let mut recent_sigs: HashMap<String, u32> = HashMap::new();
        // mtimes of files we wrote, to notice external edits between
        // iterations; and where the user's editor focus last was.
        let mut written_mtimes: HashMap<String, u64> = HashMap::new();
        let mut last_editor_focus: Option<String> = deps.host.active_editor_path();
        let mut consecutive_no_tool = 0u32;
        let mut wrote_files: Vec<String> = Vec::new();
        let mut ran_terminal = false;
        let mut run_gate_fired = false;
        let mut diag_gate_fired = false;
        let mut compact_pending = false;
        let mut streamed_text = String::new();
        let mut all_thinking = String::new();
        let mut tool_outputs: Vec<(String, String)> = Vec::new();
        let mut status = SessionStatus::Completed;
        let mut iterations = 0u32;

        'iterations: for i in 1..=self.cfg.max_iterations {
            iterations = i;
            if cancel.is_cancelled() {
                status = SessionStatus::Cancelled;
                break;
            }
            bus.post(UiEvent::IterationBoundary {
                iteration: i,
                max_iterations: self.cfg.max_iterations,
            });

            if i > 1 {
                history.clean_stale_system_notes();
                memory.apply_to(&mut history);

                // Files we wrote that changed on disk since were edited
                // outside the loop; the model must re-read before touching
                // them again.
                for (path, recorded) in written_mtimes.clone() {
                    if let Ok(stat) = deps.host.stat(&path).await {
                        if stat.mtime_ms > recorded {
                            written_mtimes.insert(path.clone(), stat.mtime_ms);
                            history.add_system_note(&format!(
                                "{path} was modified outside this session; \
                                 re-read it before editing again."
                            ));
                        }
                    }
                }

                let focus = deps.host.active_editor_path();
                if focus != last_editor_focus {
                    if let Some(path) = &focus {
                        history.add_system_note(&format!("The user is now viewing {path}."));
                    }
                    last_editor_focus = focus;
                }

                let est = history.approx_tokens();
                if compact_pending || budgeter.should_compact(budgeter.tokens_for_compaction(est))
                {
                    compact_pending = false;
                    let report = compact_history(
                        &mut history,
                        deps.backend.as_ref(),
                        &model,
                        deps.config.context.compaction_keep_recent,
                    )
                    .await?;
                    budgeter.clear_prompt_actual();
                    bus.emit(UiEvent::ShowToolAction {
                        id: format!("compact-{i}"),
                        tool: "compact".into(),
                        title: format!("Condensed {} messages", report.summarized_messages),
                        status: ActionStatus::Success,
                    })
                    .await;
                    debug!(
                        before = report.tokens_before,
                        after = report.tokens_after,
                        "history compacted"
                    );
                }
            }

            let messages = history.prepare_for_request();
            let payload = ContextBudgeter::estimate_payload_tokens(&messages);
            let req = ChatRequest {
                model: model.clone(),
                messages,
                options: ChatOptions {
                    temperature: deps.config.model.temperature,
                    num_predict: deps.config.model.num_predict,
                    num_ctx: Some(budgeter.num_ctx_for(payload)),
                    stop: Vec::new(),
                },
                tools: native.then(|| {
                    let mut specs: Vec<ToolSpec> = deps
                        .registry
                        .schemas_for(allowed)
                        .into_iter()
                        .map(|s| ToolSpec::function(s.name, s.description, s.parameters))
                        .collect();
                    if self.subagent.is_some() && mode.allows_subagents() {
                        specs.push(subagent_tool_spec());
                    }
                    specs
                }),
                keep_alive: deps.config.model.keep_alive.clone(),
                stream: true,
            };

            let stream = match deps.backend.chat(req, cancel.clone()).await {
                Ok(s) => s,
                Err(BackendError::Cancelled) => {
                    status = SessionStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    self.fatal(&bus, &e, i).await;
                    status = SessionStatus::Error;
                    break;
                }
            };

            let decoder = StreamDecoder::new(&bus, &known_tools, native);
            let res = match decoder.decode(stream, &cancel).await {
                Ok(r) => r,
                Err(e) => {
                    self.fatal(&bus, &e, i).await;
                    status = SessionStatus::Error;
                    break;
                }
            };
            all_thinking.push_str(&res.thinking);

            if res.cancelled {
                if !res.thinking.trim().is_empty() {
                    bus.emit(UiEvent::ThinkingBlock {
                        text: res.thinking.clone(),
                    })
                    .await;
                }
                status = SessionStatus::Cancelled;
                break;
            }

            if let Some(prompt_tokens) = res.prompt_tokens {
                bus.post(UiEvent::TokenUsage {
                    prompt: prompt_tokens,
                    completion: res.completion_tokens.unwrap_or(0),
                    window: budgeter.effective_window(),
                });
                if budgeter.record_prompt_eval(prompt_tokens, payload) {
                    compact_pending = true;
                }
                if let Some(reminder) = budgeter.usage_reminder(prompt_tokens) {
                    history.add_system_note(&reminder);
                }
            }

            let recovered: Vec<ToolCall> = res
                .tool_parse_errors
                .iter()
                .filter_map(|e| {
                    let call = recover_tool_call(e);
                    if call.is_none() {
                        warn!(error = %e, "unrecoverable tool-call parse error");
                    }
                    call
                })
                .collect();
            if !res.tool_parse_errors.is_empty() && recovered.is_empty() {
                history.add_system_note(
                    "Your last tool call was malformed JSON and could not be repaired. \
                     Re-issue it with valid JSON.",
                );
            }

            if res.truncated && !res.response.is_empty() {
                history.add_assistant_message(&res.response, &res.thinking);
                history.add_continuation(
                    "Your response was truncated at the output limit. \
                     Continue exactly where you left off.",
                );
                streamed_text.push_str(&res.response);
                continue;
            }

            if !res.thinking.trim().is_empty() {
                bus.emit(UiEvent::ThinkingBlock {
                    text: res.thinking.clone(),
                })
                .await;
            }

            let response = dedup_thinking_echo(&res.response, &res.thinking);
            let visible = strip_completion_sentinel(&response);
            if !visible.is_empty() {
                let _ = deps
                    .store
                    .add_message(
                        &session_id,
                        "assistant",
                        &visible,
                        AddMessage {
                            model: Some(model.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
                if !streamed_text.is_empty() {
                    streamed_text.push('\n');
                }
                streamed_text.push_str(&visible);
                // In native mode the decoder never streams content live
                // (any of it may be call syntax); deliver the settled
                // iteration delta to the UI now.
                if native {
                    bus.post(UiEvent::StreamChunk {
                        text: visible.clone(),
                    });
                }
            }

            if completion_signaled(&response, &res.thinking) {
                let gate_reason = self
                    .completion_gate_failure(
                        &deps,
                        &wrote_files,
                        ran_terminal,
                        &mut run_gate_fired,
                        &mut diag_gate_fired,
                    )
                    .await;
                if let Some(reason) = gate_reason {
                    debug!(iteration = i, "completion rejected by gate");
                    history.add_assistant_message(&response, &res.thinking);
                    history.add_continuation(reason);
                    continue;
                }
                status = SessionStatus::Completed;
                break;
            }

            let mut calls: Vec<ToolCall> = if native {
                res.native_tool_calls
            } else {
                extract_text_tool_calls(&response, &known_tools)
            };
            calls.extend(recovered);
            let (calls, _dropped) = toolset::filter_calls(mode, calls);

            if calls.is_empty() {
                history.add_assistant_message(&response, &res.thinking);
                consecutive_no_tool += 1;
                match check_no_tool_completion(
                    &response,
                    !wrote_files.is_empty(),
                    consecutive_no_tool,
                    mode,
                ) {
                    NoToolDecision::BreakImplicit | NoToolDecision::BreakConsecutive => {
                        status = SessionStatus::Completed;
                        break;
                    }
                    NoToolDecision::Continue(probe) => {
                        history.add_continuation(probe);
                        continue;
                    }
                }
            }
            consecutive_no_tool = 0;

            let calls = dedupe_calls(calls, &recent_sigs, i);
            if calls.is_empty() {
                history.add_assistant_message(&response, &res.thinking);
                history.add_system_note(
                    "You are repeating tool calls you already made. Use the results \
                     you already have, or take a different approach.",
                );
                continue;
            }
            let calls: Vec<ToolCall> = calls.into_iter().take(BATCH_CAP).collect();

            history.add_assistant_tool_message(&calls, &response, &res.thinking);

            let batch = dispatcher.execute_batch(calls, &cancel).await;

            // Every surviving call — including denials — feeds the duplicate
            // filter, so a denied command is not re-attempted next iteration.
            for e in &batch.executed {
                recent_sigs.insert(e.call.signature(), i);
            }
            recent_sigs.retain(|_, last| i.saturating_sub(*last) <= SIG_RETENTION);

            for f in &batch.wrote_files {
                if !wrote_files.contains(f) {
                    wrote_files.push(f.clone());
                }
                if let Ok(stat) = deps.host.stat(f).await {
                    written_mtimes.insert(f.clone(), stat.mtime_ms);
                }
            }
            ran_terminal |= batch.ran_terminal;
            for (name, output) in batch.native_results() {
                tool_outputs.push((name, output));
            }

            memory.add_iteration_summary(IterationSummary {
                iteration: i,
                tool_names: batch.executed.iter().map(|e| e.call.name.clone()).collect(),
                brief: iteration_brief(&batch.executed),
                success: batch.executed.iter().all(|e| !e.result.is_error()),
            });
            let _ = deps
                .store
                .save_session_memory(&session_id, &memory.to_json())
                .await;

            let mut packet = ControlPacket::new(ControlState::NeedTools, i, self.cfg.max_iterations)
                .with_files(wrote_files.clone())
                .with_tool_results(batch.executed.len() as u32);
            let digest = memory.compact_summary();
            if !digest.is_empty() {
                packet = packet.with_note(digest);
            }

            if native {
                history.add_native_tool_results(&batch.native_results());
                history.add_continuation(packet.render());
            } else {
                history.add_xml_tool_results(&batch.text_results(), &packet.render());
            }
            for note in &batch.notes {
                history.add_system_note(note);
            }

            if cancel.is_cancelled() {
                status = SessionStatus::Cancelled;
                break 'iterations;
            }
        }

        // ── Finalize ─────────────────────────────────────────────────────────
        if status == SessionStatus::Cancelled {
            self.deps.gate.cancel_all();
        }

        if !wrote_files.is_empty() {
            bus.emit(UiEvent::FilesChanged {
                files: wrote_files.clone(),
            })
            .await;
        }

        let final_text = if status == SessionStatus::Cancelled {
            // A cancelled turn publishes no final message; partial text was
            // already streamed and persisted.
            String::new()
        } else {
            let summary = build_final_summary(
                deps.backend.as_ref(),
                &model,
                &SummaryInput {
                    streamed_text: &streamed_text,
                    tool_outputs: &tool_outputs,
                    condensed_thinking: &all_thinking,
                    files_modified: &wrote_files,
                },
            )
            .await;
            let _ = deps
                .store
                .add_message(
                    &session_id,
                    "assistant",
                    &summary,
                    AddMessage {
                        model: Some(model.clone()),
                        ..Default::default()
                    },
                )
                .await;
            if summary.trim() != streamed_text.trim() {
                bus.post(UiEvent::FinalMessage {
                    text: summary.clone(),
                });
            }
            summary
        };

        let _ = deps
            .store
            .update_session(
                &session_id,
                SessionPatch {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await;
        self.session.status = status;

        Ok(LoopOutcome {
            status,
            final_text,
            files_changed: wrote_files,
            iterations,
            streamed_text,
            thinking: all_thinking,
            tool_outputs,
        })
    }

    async fn fatal(&self, bus: &EventBus, err: &BackendError, iteration: u32) {
        warn!(error = %err, iteration, "fatal iteration error");
        bus.emit(UiEvent::ShowError {
            message: format!(
                "{} (model {}, iteration {}/{})",
                err, self.session.model, iteration, self.cfg.max_iterations
            ),
        })
        .await;
    }

    /// All gates must pass before a declared completion is accepted.
    async fn completion_gate_failure(
        &self,
        deps: &AgentDeps,
        wrote_files: &[String],
        ran_terminal: bool,
        run_gate_fired: &mut bool,
        diag_gate_fired: &mut bool,
    ) -> Option<String> {
        let task = &self.session.task;

        // Gate 1: a write-intent task with no writes is not done.
        if self.cfg.mode.allows_writes() && task_has_write_intent(task) && wrote_files.is_empty() {
            return Some(
                "You declared completion, but no file was modified. Reading files does \
                 not change them — make the required edits, then finish."
                    .to_string(),
            );
        }

        // Gate 2: run/test/build intent with neither a command nor a write.
        if !*run_gate_fired
            && task_has_run_intent(task)
            && !ran_terminal
            && wrote_files.is_empty()
        {
            *run_gate_fired = true;
            return Some(
                "The task asks you to run or verify something, but no command was \
                 executed. Do the work, then finish."
                    .to_string(),
            );
        }

        // Gate 3: modified files must be free of diagnostic errors.
        if !*diag_gate_fired && !wrote_files.is_empty() {
            let mut reports = Vec::new();
            for path in wrote_files {
                let diags = deps.host.wait_for_diagnostics(path, 3_000).await;
                for d in error_diagnostics(&diags) {
                    reports.push(format!("- {path} line {}: {}", d.line, d.message));
                }
            }
            if !reports.is_empty() {
                *diag_gate_fired = true;
                return Some(format!(
                    "Completion rejected: modified files still have errors.\n\
                     [AUTO-DIAGNOSTICS]\n{}",
                    reports.join("\n")
                ));
            }
        }

        None
    }
}

/// Wire schema of the sub-agent pseudo-tool.  It has no registry entry;
/// the dispatcher routes it to the injected runner.
fn subagent_tool_spec() -> ToolSpec {
    ToolSpec::function(
        crate::dispatch::SUBAGENT_TOOL,
        "Delegate a focused read-only task to a sub-agent and get its findings back. \
         Use this for all code reading and searching.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the sub-agent should find out" },
                "mode": { "type": "string", "enum": ["explore", "plan", "chat"] },
                "title": { "type": "string", "description": "Short progress label" },
                "context_hint": { "type": "string", "description": "Context the sub-agent needs" },
                "description": { "type": "string" }
            },
            "required": ["task"]
        }),
    )
}

/// The ONLY accepted completion signals: the literal sentinel in either
/// channel, or a control packet declaring `complete`.
pub(crate) fn completion_signaled(response: &str, thinking: &str) -> bool {
    if contains_completion_sentinel(response) || contains_completion_sentinel(thinking) {
        return true;
    }
    matches!(
        ControlPacket::parse(response),
        Some(p) if p.state == ControlState::Complete
    )
}

fn task_has_write_intent(task: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(add|create|write|implement|fix|refactor|rename|update|modify|remove|delete|change|patch)\b",
        )
        .expect("write intent pattern")
    })
    .is_match(task)
}

fn task_has_run_intent(task: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(run|test|build|execute|compile|verify|benchmark)\b")
            .expect("run intent pattern")
    })
    .is_match(task)
}

/// Some models replay their thinking verbatim at the start of the response;
/// drop the echo so it is not shown (and stored) twice.
fn dedup_thinking_echo(response: &str, thinking: &str) -> String {
    let t = thinking.trim();
    if t.len() > 20 {
        if let Some(rest) = response.trim_start().strip_prefix(t) {
            return rest.trim_start().to_string();
        }
    }
    response.to_string()
}

fn check_no_tool_completion(
    response: &str,
    has_written_files: bool,
    consecutive_no_tool: u32,
    mode: AgentMode,
) -> NoToolDecision {
    if consecutive_no_tool >= MAX_CONSECUTIVE_NO_TOOL {
        return NoToolDecision::BreakConsecutive;
    }
    if !response.trim().is_empty() {
        // A substantive answer after completed work, or in a mode whose
        // deliverable IS the answer, ends the loop implicitly.
        if has_written_files || !mode.allows_writes() {
            return NoToolDecision::BreakImplicit;
        }
        return NoToolDecision::Continue(
            "If the task is finished, reply with [TASK_COMPLETE]; otherwise continue \
             with tool calls.",
        );
    }
    NoToolDecision::Continue(
        "You produced no response or tool call. Continue with your next action, or \
         finish with [TASK_COMPLETE].",
    )
}

/// Intra-batch + cross-iteration duplicate suppression.
fn dedupe_calls(
    calls: Vec<ToolCall>,
    recent: &HashMap<String, u32>,
    iteration: u32,
) -> Vec<ToolCall> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for call in calls {
        let sig = call.signature();
        if !seen.insert(sig.clone()) {
            debug!(tool = %call.name, "dropping intra-batch duplicate");
            continue;
        }
        if let Some(&last) = recent.get(&sig) {
            if iteration.saturating_sub(last) <= DUP_WINDOW {
                debug!(tool = %call.name, last, "dropping recent duplicate");
                continue;
            }
        }
        out.push(call);
    }
    out
}

fn iteration_brief(executed: &[crate::dispatch::ExecutedCall]) -> String {
    let failed = executed.iter().filter(|e| e.result.is_error()).count();
    if failed == 0 {
        format!("{} tool call(s) ok", executed.len())
    } else {
        format!("{} tool call(s), {failed} failed", executed.len())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
