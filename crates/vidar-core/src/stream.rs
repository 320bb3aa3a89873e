// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming decoder for one model turn.
//!
//! Separates the three token channels (thinking, content, tool calls),
//! drives UI ticks with a synchronous time-based throttle, and freezes the
//! content channel as soon as tool-call syntax can follow — subsequent
//! "content" may be call markup that must never flash on screen.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use vidar_model::{BackendError, ChunkStream};
use vidar_tools::ToolCall;

use crate::events::{ActionStatus, EventBus, UiEvent};
use crate::textcalls::{
    detect_partial_tool_call, holdback_partial_sentinel, remove_completion_sentinel,
};

/// Minimum interval between streamChunk posts.  Deliberately a synchronous
/// time check — deferred scheduling starves in a tight decode loop.
const UI_THROTTLE: Duration = Duration::from_millis(32);

#[derive(Debug, Default)]
pub struct StreamResult {
    pub response: String,
    pub thinking: String,
    pub native_tool_calls: Vec<ToolCall>,
    pub truncated: bool,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    /// Recoverable server-side tool-call parse errors, verbatim.
    pub tool_parse_errors: Vec<String>,
    pub thinking_elapsed_ms: u64,
    pub thinking_collapsed: bool,
    pub cancelled: bool,
}

pub struct StreamDecoder<'a> {
    bus: &'a EventBus,
    known_tools: &'a HashSet<String>,
    native_mode: bool,
    throttle: Duration,
}

impl<'a> StreamDecoder<'a> {
    pub fn new(bus: &'a EventBus, known_tools: &'a HashSet<String>, native_mode: bool) -> Self {
        Self {
            bus,
            known_tools,
            native_mode,
            throttle: UI_THROTTLE,
        }
    }

    /// Tests use a zero throttle so every delta posts.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub async fn decode(
        &self,
        mut stream: ChunkStream,
        cancel: &CancellationToken,
    ) -> Result<StreamResult, BackendError> {
        let mut res = StreamResult::default();
        // Text accumulated but not yet posted to the UI.
        let mut pending_ui = String::new();
        // In native mode content is never streamed live; in text mode it
        // freezes the moment a partial call is detected.
        let mut frozen = self.native_mode;
        let mut last_flush = Instant::now();
        let mut flushed_anything = false;
        let mut thinking_started: Option<Instant> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                n = stream.next() => Some(n),
            };
            let chunk = match next {
                // Cancelled: the stream is dropped right after the loop,
                // aborting the transport — a model mid-thinking can stall
                // 30+ seconds before the next token would arrive.
                None => {
                    res.cancelled = true;
                    break;
                }
                Some(None) => break,
                Some(Some(Err(e))) => return Err(e),
                Some(Some(Ok(c))) => c,
            };

            if let Some(err) = &chunk.error {
                if err.contains("error parsing tool call") {
                    res.tool_parse_errors.push(err.clone());
                    continue;
                }
                return Err(BackendError::Stream(err.clone()));
            }

            if let Some(msg) = &chunk.message {
                if let Some(t) = msg.thinking.as_deref().filter(|t| !t.is_empty()) {
                    if thinking_started.is_none() {
                        thinking_started = Some(Instant::now());
                        self.bus.post(UiEvent::ShowThinking);
                    }
                    res.thinking.push_str(t);
                    self.bus.post(UiEvent::StreamThinking {
                        text: t.to_string(),
                    });
                }

                if let Some(c) = msg.content.as_deref().filter(|c| !c.is_empty()) {
                    res.response.push_str(c);
                    if !frozen {
                        if detect_partial_tool_call(&res.response, self.known_tools) {
                            frozen = true;
                            pending_ui.clear();
                        } else {
                            pending_ui.push_str(c);
                            self.flush_pending(
                                &mut pending_ui,
                                &mut last_flush,
                                &mut flushed_anything,
                                false,
                            );
                        }
                    }
                }

                if let Some(tcs) = &msg.tool_calls {
                    for tc in tcs {
                        if res.native_tool_calls.is_empty() {
                            frozen = true;
                            pending_ui.clear();
                            self.collapse_thinking(&mut res, thinking_started);
                            self.bus.post(preparing_hint(
                                &tc.function.name,
                                &tc.function.arguments,
                            ));
                        }
                        res.native_tool_calls.push(ToolCall::from_value(
                            tc.function.name.clone(),
                            tc.function.arguments.clone(),
                        ));
                    }
                }
            }

            if chunk.done {
                res.prompt_tokens = chunk.prompt_eval_count;
                res.completion_tokens = chunk.eval_count;
                if chunk.done_reason.as_deref() == Some("length") {
                    res.truncated = true;
                }
                break;
            }
        }

        // Abort the transport before anything else happens on this turn.
        drop(stream);

        // Flush whatever is still held back, including after cancellation.
        if !frozen {
            self.flush_pending(&mut pending_ui, &mut last_flush, &mut flushed_anything, true);
        }
        if !res.thinking_collapsed {
            if let Some(start) = thinking_started {
                res.thinking_elapsed_ms = start.elapsed().as_millis() as u64;
            }
        }
        Ok(res)
    }

    fn collapse_thinking(&self, res: &mut StreamResult, started: Option<Instant>) {
        if res.thinking_collapsed {
            return;
        }
        res.thinking_collapsed = true;
        res.thinking_elapsed_ms = started.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);
        self.bus.post(UiEvent::CollapseThinking {
            elapsed_ms: res.thinking_elapsed_ms,
        });
    }

    /// Post the pending text, holding back any trailing partial completion
    /// sentinel so the stop token never flashes in the UI.
    fn flush_pending(
        &self,
        pending: &mut String,
        last_flush: &mut Instant,
        flushed_anything: &mut bool,
        force: bool,
    ) {
        if pending.is_empty() {
            return;
        }
        if !force && *flushed_anything && last_flush.elapsed() < self.throttle {
            return;
        }
        let (emit, hold) = holdback_partial_sentinel(pending);
        let cleaned = remove_completion_sentinel(emit);
        let hold = hold.to_string();
        if !cleaned.is_empty() {
            self.bus.post(UiEvent::StreamChunk { text: cleaned });
            *last_flush = Instant::now();
            *flushed_anything = true;
        }
        *pending = hold;
    }
}

/// Transient "preparing" hint shown between the first tool-call delta and
/// actual dispatch, contextualised from the call's own arguments.
fn preparing_hint(name: &str, args: &serde_json::Value) -> UiEvent {
    let path = args.get("path").and_then(|v| v.as_str());
    let command = args.get("command").and_then(|v| v.as_str());
    let title = match (name, path, command) {
        ("write_file", Some(p), _) => format!("Writing {p}…"),
        ("read_file", Some(p), _) => format!("Reading {p}…"),
        ("terminal", _, Some(c)) => {
            let c: String = c.chars().take(48).collect();
            format!("Running {c}…")
        }
        _ => format!("Preparing {name}…"),
    };
    UiEvent::ShowToolAction {
        id: format!("prep-{name}"),
        tool: name.to_string(),
        title,
        status: ActionStatus::Running,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
