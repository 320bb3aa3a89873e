// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Protocol-correct conversation history.
//!
//! Invariants (violating any of them silently degrades model quality):
//! - index 0 is always the system message
//! - `thinking` never appears on a message sent back to the model
//! - an assistant turn that produced tool calls is followed by one `tool`
//!   message per call (native mode) or exactly one `user` message carrying
//!   all results (text mode)
//! - an assistant turn is never persisted with empty content — chat
//!   templates lose the turn entirely ("template amnesia")
//! - `[SYSTEM NOTE:` user messages live for exactly one iteration

use vidar_model::{ChatMessage, Role, WireFunction, WireToolCall};
use vidar_tools::ToolCall;

use crate::textcalls::build_tool_call_summary;

pub const SYSTEM_NOTE_PREFIX: &str = "[SYSTEM NOTE:";

/// Placeholder content for a thinking-only assistant turn.
const REASONING_PLACEHOLDER: &str = "[Reasoning completed]";

pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    native_mode: bool,
}

impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>, native_mode: bool) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
            native_mode,
        }
    }

    pub fn native_mode(&self) -> bool {
        self.native_mode
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    /// Assistant turn without tool calls.  The blank-turn rule applies:
    /// a turn that only produced thinking gets a placeholder body.
    pub fn add_assistant_message(&mut self, response: &str, thinking: &str) {
        let content = if response.trim().is_empty() {
            if thinking.trim().is_empty() {
                return;
            }
            REASONING_PLACEHOLDER.to_string()
        } else {
            response.to_string()
        };
        let mut msg = ChatMessage::assistant(content);
        if !thinking.trim().is_empty() {
            msg.thinking = Some(thinking.to_string());
        }
        self.messages.push(msg);
    }

    /// Assistant turn that carries tool calls.
    ///
    /// Native mode attaches the structured `tool_calls` field; text mode
    /// embeds a `[Called: …]` annotation in the content instead.  Either
    /// way the content is never empty.
    pub fn add_assistant_tool_message(
        &mut self,
        calls: &[ToolCall],
        response: &str,
        thinking: &str,
    ) {
        let summary = build_tool_call_summary(calls);
        let content = if response.trim().is_empty() {
            summary.clone()
        } else if self.native_mode {
            response.to_string()
        } else {
            format!("{response}\n{summary}")
        };

        let mut msg = ChatMessage::assistant(content);
        if !thinking.trim().is_empty() {
            msg.thinking = Some(thinking.to_string());
        }
        if self.native_mode {
            msg.tool_calls = Some(
                calls
                    .iter()
                    .map(|c| WireToolCall {
                        function: WireFunction {
                            name: c.name.clone(),
                            arguments: serde_json::Value::Object(c.args.clone()),
                        },
                    })
                    .collect(),
            );
        }
        self.messages.push(msg);
    }

    /// One `tool` message per result.  Valid only in native mode.
    pub fn add_native_tool_results(&mut self, results: &[(String, String)]) {
        debug_assert!(self.native_mode, "native results pushed in text mode");
        for (tool_name, content) in results {
            self.messages
                .push(ChatMessage::tool(tool_name.clone(), content.clone()));
        }
    }

    /// All results of the batch as a single user message, double-newline
    /// joined, with the continuation directive appended.  Text mode only.
    pub fn add_xml_tool_results(&mut self, results: &[String], continuation: &str) {
        debug_assert!(!self.native_mode, "text results pushed in native mode");
        let mut body = results.join("\n\n");
        if !continuation.is_empty() {
            body.push_str("\n\n");
            body.push_str(continuation);
        }
        self.messages.push(ChatMessage::user(body));
    }

    /// Continuation probe between iterations.
    pub fn add_continuation(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    /// Ephemeral system note — removed at the start of the next iteration.
    pub fn add_system_note(&mut self, text: &str) {
        self.messages
            .push(ChatMessage::user(format!("{SYSTEM_NOTE_PREFIX} {text}]")));
    }

    /// Drop every stale system note.
    pub fn clean_stale_system_notes(&mut self) {
        self.messages.retain(|m| {
            !(m.role == Role::User && m.content.starts_with(SYSTEM_NOTE_PREFIX))
        });
    }

    /// In-place transform of the system prompt at index 0.
    pub fn update_system_prompt(&mut self, f: impl FnOnce(&str) -> String) {
        if let Some(first) = self.messages.first_mut() {
            debug_assert!(first.role == Role::System);
            first.content = f(&first.content);
        }
    }

    /// The request view of the history: every message with `thinking`
    /// stripped.
    pub fn prepare_for_request(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.thinking = None;
                m
            })
            .collect()
    }

    /// Replace the full message list (compaction).  The caller guarantees
    /// the invariants still hold.
    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        debug_assert!(matches!(messages.first(), Some(m) if m.role == Role::System));
        self.messages = messages;
    }

    pub fn approx_tokens(&self) -> u32 {
        self.messages.iter().map(|m| m.approx_tokens()).sum()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
