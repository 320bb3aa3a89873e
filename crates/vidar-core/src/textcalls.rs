// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Text-mode tool-call wire format.
//!
//! Models without native tool calling emit calls as text, either wrapped in
//! `<tool_call>…</tool_call>` tags or as bare JSON objects.  This module
//! extracts complete calls, detects a *partial* call mid-stream so the
//! decoder can stop forwarding text to the UI, and handles the completion
//! sentinel.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;
use vidar_tools::ToolCall;

pub const TASK_COMPLETE: &str = "[TASK_COMPLETE]";

/// True when `text` contains the literal completion sentinel
/// (case-insensitive).  Loose paraphrases ("the task is complete") never
/// match — models use them to escape the loop prematurely.
pub fn contains_completion_sentinel(text: &str) -> bool {
    text.to_ascii_uppercase().contains(TASK_COMPLETE)
}

/// Remove every occurrence of the completion sentinel, preserving
/// surrounding whitespace (safe to apply to mid-stream fragments).
pub fn remove_completion_sentinel(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let upper = text.to_ascii_uppercase();
    let mut pos = 0;
    while let Some(found) = upper[pos..].find(TASK_COMPLETE) {
        out.push_str(&text[pos..pos + found]);
        pos += found + TASK_COMPLETE.len();
    }
    out.push_str(&text[pos..]);
    out
}

/// Remove every occurrence of the completion sentinel and trim.
pub fn strip_completion_sentinel(text: &str) -> String {
    remove_completion_sentinel(text).trim().to_string()
}

/// Split `pending` into (emit, hold) so that a trailing prefix of the
/// completion sentinel is held back from the UI — the stop token must not
/// flash on screen as it streams in.
pub fn holdback_partial_sentinel(pending: &str) -> (&str, &str) {
    let upper = pending.to_ascii_uppercase();
    let max = TASK_COMPLETE.len().min(pending.len());
    for take in (1..=max).rev() {
        let tail_start = pending.len() - take;
        if !pending.is_char_boundary(tail_start) {
            continue;
        }
        if TASK_COMPLETE.starts_with(&upper[tail_start..]) {
            return (&pending[..tail_start], &pending[tail_start..]);
        }
    }
    (pending, "")
}

/// Detect the *start* of a tool call in partially streamed text.
///
/// Three shapes are recognised:
/// - XML style: `<tool_call>` (optionally followed by `{"name":"X"`)
/// - bare JSON with explicit keys: `{"name":"X","arguments":{`
/// - loose JSON: `{…"name":"X"…"args":{`
///
/// In the bare-JSON shapes the name must be a known tool — prose that
/// merely contains a JSON object must not freeze the stream.
pub fn detect_partial_tool_call(text: &str, known_tools: &HashSet<String>) -> bool {
    if text.contains("<tool_call>") {
        return true;
    }
    let re = bare_json_head_re();
    for caps in re.captures_iter(text) {
        if let Some(name) = caps.get(1) {
            if known_tools.contains(name.as_str()) {
                return true;
            }
        }
    }
    false
}

fn bare_json_head_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\s*"name"\s*:\s*"([A-Za-z0-9_]+)"\s*,\s*"(?:arguments|args)"\s*:\s*\{"#)
            .expect("tool-call head pattern must compile")
    })
}

/// Extract every complete tool call from a finished text response.
///
/// `<tool_call>` blocks are parsed first; any bare JSON object with a known
/// tool name is picked up afterwards.
pub fn extract_text_tool_calls(text: &str, known_tools: &HashSet<String>) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    let tag_re = Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("tag pattern");
    let mut consumed_spans: Vec<(usize, usize)> = Vec::new();
    for caps in tag_re.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        consumed_spans.push((whole.start(), whole.end()));
        if let Some(call) = parse_call_object(caps.get(1).unwrap().as_str()) {
            calls.push(call);
        }
    }

    // Bare JSON objects outside the consumed tag spans.
    for m in bare_json_head_re().find_iter(text) {
        if consumed_spans
            .iter()
            .any(|(s, e)| m.start() >= *s && m.start() < *e)
        {
            continue;
        }
        if let Some(obj) = balanced_object_at(text, m.start()) {
            if let Some(call) = parse_call_object(obj) {
                if known_tools.contains(&call.name) {
                    calls.push(call);
                }
            }
        }
    }

    calls
}

/// Parse one `{"name": …, "arguments": …}` object into a call.
fn parse_call_object(json: &str) -> Option<ToolCall> {
    let v: Value = serde_json::from_str(json).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    let args = v
        .get("arguments")
        .or_else(|| v.get("args"))
        .cloned()
        .unwrap_or(Value::Object(Default::default()));
    Some(ToolCall::from_value(name, args))
}

/// The balanced `{…}` starting at byte offset `start`, honouring strings
/// and escapes.  Returns `None` when the object never closes.
pub fn balanced_object_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// A compact one-line rendering of a batch, used both for the blank-turn
/// placeholder and the text-mode `[Called: …]` annotation.
pub fn build_tool_call_summary(calls: &[ToolCall]) -> String {
    let rendered: Vec<String> = calls
        .iter()
        .map(|c| {
            let args: Vec<String> = c
                .args
                .iter()
                .map(|(k, v)| {
                    let val = match v {
                        Value::String(s) if s.chars().count() > 40 => {
                            let head: String = s.chars().take(40).collect();
                            format!("\"{head}…\"")
                        }
                        other => other.to_string(),
                    };
                    format!("{k}={val}")
                })
                .collect();
            format!("{}({})", c.name, args.join(", "))
        })
        .collect();
    format!("[Called: {}]", rendered.join(", "))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn known(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ── sentinel ──────────────────────────────────────────────────────────────

    #[test]
    fn sentinel_detected_case_insensitively() {
        assert!(contains_completion_sentinel("done [task_complete]"));
        assert!(contains_completion_sentinel("[TASK_COMPLETE]"));
    }

    #[test]
    fn loose_phrases_are_not_completion() {
        assert!(!contains_completion_sentinel("the task is complete"));
        assert!(!contains_completion_sentinel("TASK COMPLETE"));
    }

    #[test]
    fn strip_removes_sentinel_and_trims() {
        assert_eq!(
            strip_completion_sentinel("All done. [TASK_COMPLETE]"),
            "All done."
        );
    }

    #[test]
    fn holdback_keeps_partial_sentinel_tail() {
        let (emit, hold) = holdback_partial_sentinel("answer [TASK_CO");
        assert_eq!(emit, "answer ");
        assert_eq!(hold, "[TASK_CO");
    }

    #[test]
    fn holdback_passes_clean_text_through() {
        let (emit, hold) = holdback_partial_sentinel("plain text");
        assert_eq!(emit, "plain text");
        assert_eq!(hold, "");
    }

    #[test]
    fn holdback_handles_lone_bracket() {
        let (emit, hold) = holdback_partial_sentinel("see [");
        assert_eq!(emit, "see ");
        assert_eq!(hold, "[");
    }

    // ── partial detection ─────────────────────────────────────────────────────

    #[test]
    fn xml_tag_triggers_freeze() {
        assert!(detect_partial_tool_call("text <tool_call>{\"na", &known(&[])));
    }

    #[test]
    fn bare_json_with_known_name_triggers_freeze() {
        let text = r#"I'll search: {"name":"grep","arguments":{"query"#;
        assert!(detect_partial_tool_call(text, &known(&["grep"])));
    }

    #[test]
    fn bare_json_with_unknown_name_does_not_freeze() {
        let text = r#"example: {"name":"foo","arguments":{"x":1}}"#;
        assert!(!detect_partial_tool_call(text, &known(&["grep"])));
    }

    #[test]
    fn args_key_variant_recognised() {
        let text = r#"{"name":"search","args":{"query":"x"}}"#;
        assert!(detect_partial_tool_call(text, &known(&["search"])));
    }

    // ── extraction ────────────────────────────────────────────────────────────

    #[test]
    fn extracts_tagged_call() {
        let text = r#"<tool_call>{"name":"read_file","arguments":{"path":"src/a.ts"}}</tool_call>"#;
        let calls = extract_text_tool_calls(text, &known(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].str_arg("path"), Some("src/a.ts"));
    }

    #[test]
    fn extracts_multiple_tagged_calls() {
        let text = concat!(
            r#"<tool_call>{"name":"grep","arguments":{"query":"a"}}</tool_call>"#,
            "\n",
            r#"<tool_call>{"name":"grep","arguments":{"query":"b"}}</tool_call>"#,
        );
        let calls = extract_text_tool_calls(text, &known(&["grep"]));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].str_arg("query"), Some("b"));
    }

    #[test]
    fn extracts_bare_json_for_known_tool() {
        let text = r#"Let me look. {"name":"search","arguments":{"query":"main"}} done"#;
        let calls = extract_text_tool_calls(text, &known(&["search"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].str_arg("query"), Some("main"));
    }

    #[test]
    fn bare_json_unknown_tool_ignored() {
        let text = r#"{"name":"nope","arguments":{"x":1}}"#;
        assert!(extract_text_tool_calls(text, &known(&["grep"])).is_empty());
    }

    #[test]
    fn tagged_call_not_double_extracted_as_bare_json() {
        let text = r#"<tool_call>{"name":"grep","arguments":{"query":"x"}}</tool_call>"#;
        let calls = extract_text_tool_calls(text, &known(&["grep"]));
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn nested_braces_in_arguments_survive() {
        let text = r#"{"name":"write_file","arguments":{"path":"a.json","content":"{\"k\":{}}"}}"#;
        let calls = extract_text_tool_calls(text, &known(&["write_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].str_arg("content"), Some("{\"k\":{}}"));
    }

    #[test]
    fn balanced_object_ignores_braces_in_strings() {
        let text = r#"{"a":"}{","b":1}"#;
        assert_eq!(balanced_object_at(text, 0), Some(text));
    }

    #[test]
    fn unterminated_object_returns_none() {
        assert_eq!(balanced_object_at(r#"{"a":1"#, 0), None);
    }

    // ── summary ───────────────────────────────────────────────────────────────

    #[test]
    fn summary_renders_name_and_args() {
        let calls = vec![ToolCall::from_value(
            "read_file",
            json!({"path": "src/a.rs"}),
        )];
        assert_eq!(
            build_tool_call_summary(&calls),
            r#"[Called: read_file(path="src/a.rs")]"#
        );
    }

    #[test]
    fn summary_truncates_long_string_args() {
        let long = "x".repeat(100);
        let calls = vec![ToolCall::from_value("write_file", json!({"content": long}))];
        let s = build_tool_call_summary(&calls);
        assert!(s.len() < 100);
        assert!(s.contains('…'));
    }
}
