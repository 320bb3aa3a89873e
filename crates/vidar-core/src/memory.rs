// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session running log of what each iteration did.
//!
//! Rendered back into the system prompt as a `<session_memory>` block so
//! the model keeps a cheap long-horizon view even after compaction.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::history::ConversationHistory;

/// How many summaries the rendered reminder shows; older entries elide
/// into a count.
const RENDERED_ENTRIES: usize = 10;
/// Hard cap on retained entries.
const MAX_ENTRIES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub tool_names: Vec<String>,
    pub brief: String,
    pub success: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionMemory {
    entries: Vec<IterationSummary>,
    facts: Vec<String>,
}

impl SessionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_iteration_summary(&mut self, summary: IterationSummary) {
        self.entries.push(summary);
        if self.entries.len() > MAX_ENTRIES {
            self.entries.remove(0);
        }
    }

    /// Record a discovered fact (file location, build quirk, …).
    pub fn add_fact(&mut self, fact: impl Into<String>) {
        let fact = fact.into();
        if !self.facts.contains(&fact) {
            self.facts.push(fact);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.facts.is_empty()
    }

    /// One-line digest for embedding in a control packet.
    pub fn compact_summary(&self) -> String {
        match self.entries.last() {
            Some(last) => format!(
                "iteration {}: {} [{}]",
                last.iteration,
                last.brief,
                last.tool_names.join(", ")
            ),
            None => String::new(),
        }
    }

    /// The `<session_memory>` block injected into the system prompt.
    pub fn to_system_reminder(&self) -> String {
        let mut out = String::from("<session_memory>\n");
        let elided = self.entries.len().saturating_sub(RENDERED_ENTRIES);
        if elided > 0 {
            out.push_str(&format!("({elided} earlier iterations elided)\n"));
        }
        for e in self.entries.iter().skip(elided) {
            let status = if e.success { "ok" } else { "failed" };
            out.push_str(&format!(
                "- iter {} [{}] {}: {}\n",
                e.iteration,
                status,
                e.tool_names.join(","),
                e.brief
            ));
        }
        if !self.facts.is_empty() {
            out.push_str("facts:\n");
            for f in &self.facts {
                out.push_str(&format!("- {f}\n"));
            }
        }
        out.push_str("</session_memory>");
        out
    }

    /// Install (or replace) the reminder block in the system prompt.
    /// Stale blocks are replaced in place, never accumulated.
    pub fn apply_to(&self, history: &mut ConversationHistory) {
        if self.is_empty() {
            return;
        }
        let block = self.to_system_reminder();
        history.update_system_prompt(|old| {
            let re = Regex::new(r"(?s)\n?<session_memory>.*?</session_memory>")
                .expect("session memory pattern");
            if re.is_match(old) {
                let rep = format!("\n{block}");
                re.replace(old, regex::NoExpand(&rep)).to_string()
            } else {
                format!("{old}\n{block}")
            }
        });
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u32, brief: &str) -> IterationSummary {
        IterationSummary {
            iteration: i,
            tool_names: vec!["grep".into()],
            brief: brief.into(),
            success: true,
        }
    }

    #[test]
    fn compact_summary_uses_latest_entry() {
        let mut m = SessionMemory::new();
        m.add_iteration_summary(entry(1, "looked around"));
        m.add_iteration_summary(entry(2, "found the bug"));
        let s = m.compact_summary();
        assert!(s.contains("iteration 2"));
        assert!(s.contains("found the bug"));
    }

    #[test]
    fn reminder_elides_older_entries() {
        let mut m = SessionMemory::new();
        for i in 0..15 {
            m.add_iteration_summary(entry(i, "step"));
        }
        let r = m.to_system_reminder();
        assert!(r.contains("(5 earlier iterations elided)"));
        assert!(!r.contains("- iter 0 "));
        assert!(r.contains("- iter 14 "));
    }

    #[test]
    fn entries_capped() {
        let mut m = SessionMemory::new();
        for i in 0..60 {
            m.add_iteration_summary(entry(i, "x"));
        }
        assert_eq!(m.compact_summary().contains("iteration 59"), true);
        let r = m.to_system_reminder();
        assert!(r.contains("(40 earlier iterations elided)"));
    }

    #[test]
    fn facts_deduplicate() {
        let mut m = SessionMemory::new();
        m.add_fact("tests live in tests/");
        m.add_fact("tests live in tests/");
        let r = m.to_system_reminder();
        assert_eq!(r.matches("tests live in tests/").count(), 1);
    }

    #[test]
    fn apply_installs_block_once() {
        let mut m = SessionMemory::new();
        m.add_iteration_summary(entry(1, "did a thing"));
        let mut h = ConversationHistory::new("base prompt", true);
        m.apply_to(&mut h);
        let sys = &h.messages()[0].content;
        assert!(sys.starts_with("base prompt"));
        assert_eq!(sys.matches("<session_memory>").count(), 1);
    }

    #[test]
    fn apply_replaces_stale_block() {
        let mut m = SessionMemory::new();
        m.add_iteration_summary(entry(1, "first"));
        let mut h = ConversationHistory::new("base", true);
        m.apply_to(&mut h);

        m.add_iteration_summary(entry(2, "second"));
        m.apply_to(&mut h);

        let sys = &h.messages()[0].content;
        assert_eq!(sys.matches("<session_memory>").count(), 1);
        assert!(sys.contains("second"));
    }

    #[test]
    fn empty_memory_leaves_prompt_untouched() {
        let m = SessionMemory::new();
        let mut h = ConversationHistory::new("base", true);
        m.apply_to(&mut h);
        assert_eq!(h.messages()[0].content, "base");
    }

    #[test]
    fn json_round_trip() {
        let mut m = SessionMemory::new();
        m.add_iteration_summary(entry(3, "x"));
        m.add_fact("a fact");
        let json = m.to_json();
        let back: SessionMemory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.facts.len(), 1);
    }
}
