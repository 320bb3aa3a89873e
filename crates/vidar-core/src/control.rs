// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured between-iteration control packets.
//!
//! A packet is embedded in the continuation user message so the model sees
//! machine-readable loop state alongside a one-line directive.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    NeedTools,
    NeedFixes,
    NeedSummary,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPacket {
    pub state: ControlState,
    pub iteration: u32,
    pub max_iterations: u32,
    pub remaining_iterations: u32,
    pub files_changed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ControlPacket {
    pub fn new(state: ControlState, iteration: u32, max_iterations: u32) -> Self {
        Self {
            state,
            iteration,
            max_iterations,
            remaining_iterations: max_iterations.saturating_sub(iteration),
            files_changed: Vec::new(),
            tool_results: None,
            note: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_changed = files;
        self
    }

    pub fn with_tool_results(mut self, count: u32) -> Self {
        self.tool_results = Some(count);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Wire form: `<agent_control>{json}</agent_control>` followed by a
    /// one-line natural-language directive.
    pub fn render(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("<agent_control>{json}</agent_control>\n{}", self.directive())
    }

    fn directive(&self) -> &'static str {
        match self.state {
            ControlState::NeedTools => "Proceed with tool calls or [TASK_COMPLETE].",
            ControlState::NeedFixes => "Fix the reported problems, then continue.",
            ControlState::NeedSummary => "Summarise what was done. Do not call more tools.",
            ControlState::Complete => "The task is finished.",
        }
    }

    /// Extract the first control packet embedded in `text`, if any.
    pub fn parse(text: &str) -> Option<ControlPacket> {
        let re = Regex::new(r"(?s)<agent_control>\s*(\{.*?\})\s*</agent_control>").ok()?;
        let caps = re.captures(text)?;
        serde_json::from_str(caps.get(1)?.as_str()).ok()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_embeds_json_and_directive() {
        let p = ControlPacket::new(ControlState::NeedTools, 3, 25)
            .with_files(vec!["src/a.rs".into()])
            .with_tool_results(2);
        let s = p.render();
        assert!(s.starts_with("<agent_control>{"));
        assert!(s.contains("\"state\":\"need_tools\""));
        assert!(s.contains("\"remainingIterations\":22"));
        assert!(s.contains("\"filesChanged\":[\"src/a.rs\"]"));
        assert!(s.ends_with("Proceed with tool calls or [TASK_COMPLETE]."));
    }

    #[test]
    fn parse_round_trips_render() {
        let p = ControlPacket::new(ControlState::NeedFixes, 5, 10).with_note("diag errors");
        let parsed = ControlPacket::parse(&p.render()).unwrap();
        assert_eq!(parsed.state, ControlState::NeedFixes);
        assert_eq!(parsed.iteration, 5);
        assert_eq!(parsed.note.as_deref(), Some("diag errors"));
    }

    #[test]
    fn parse_finds_packet_inside_prose() {
        let text = format!(
            "Some text before.\n{}\ntrailing",
            ControlPacket::new(ControlState::Complete, 1, 5).render()
        );
        let parsed = ControlPacket::parse(&text).unwrap();
        assert_eq!(parsed.state, ControlState::Complete);
    }

    #[test]
    fn parse_rejects_text_without_packet() {
        assert!(ControlPacket::parse("task is complete, thanks").is_none());
    }

    #[test]
    fn parse_rejects_malformed_json() {
        assert!(ControlPacket::parse("<agent_control>{nope}</agent_control>").is_none());
    }

    #[test]
    fn optional_fields_omitted_from_wire() {
        let s = ControlPacket::new(ControlState::NeedTools, 1, 2).render();
        assert!(!s.contains("toolResults"));
        assert!(!s.contains("note"));
    }
}
