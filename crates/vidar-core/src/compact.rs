// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History compaction and tool-result truncation.

use tracing::warn;
use vidar_model::{ChatBackend, ChatMessage, ChatRequest, Role};
use vidar_tools::ToolKind;

use crate::history::ConversationHistory;

const SUMMARIZE_PROMPT: &str = "You are a context compaction assistant for a software \
engineering agent. Summarise the following conversation history in a concise, \
information-dense way. Preserve all technical details, decisions, file names, error \
messages, and tool outputs that may be relevant to future work. The summary will \
replace the original history to free up context space.";

const EMERGENCY_NOTICE: &str = "[Context emergency-compacted: earlier history was dropped \
to prevent a context-window overflow. The agent may lack full context for earlier \
decisions. Proceed carefully.]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub summarized_messages: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

/// Summarise the oldest turns through one model call and rebuild the
/// history as `[system, summary, recent…]`.
///
/// The last `keep_recent` non-system messages survive verbatim, with the
/// split walked backwards so a tool-call/tool-result group is never torn
/// apart (an orphaned tool result corrupts the wire shape of the next
/// request).  When the model call fails or returns nothing, falls back to
/// the deterministic emergency path.
pub async fn compact_history(
    history: &mut ConversationHistory,
    backend: &dyn ChatBackend,
    model: &str,
    keep_recent: usize,
) -> anyhow::Result<CompactionReport> {
    let tokens_before = history.approx_tokens();
    let system = history.messages()[0].clone();
    let non_system: Vec<ChatMessage> = history
        .messages()
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let mut split = non_system.len().saturating_sub(keep_recent);
    // Never begin the preserved tail inside a tool interaction group.
    while split > 0 && split < non_system.len() && is_tool_group_member(&non_system[split]) {
        split -= 1;
    }

    if split == 0 {
        // Nothing old enough to summarise — emergency drop is all we can do.
        let dropped = emergency_compact(history, keep_recent);
        return Ok(CompactionReport {
            summarized_messages: dropped,
            tokens_before,
            tokens_after: history.approx_tokens(),
        });
    }

    let (old, recent) = non_system.split_at(split);
    let prompt = format!("{SUMMARIZE_PROMPT}\n\n---\n\n{}", serialize_history(old));

    let req = ChatRequest {
        model: model.to_string(),
        messages: vec![system.clone(), ChatMessage::user(prompt)],
        stream: false,
        ..Default::default()
    };

    let summary = match backend.chat_no_stream(req).await {
        Ok(resp) => resp.message.content.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "compaction model call failed; using emergency compact");
            String::new()
        }
    };

    if summary.trim().is_empty() {
        let dropped = emergency_compact(history, keep_recent);
        return Ok(CompactionReport {
            summarized_messages: dropped,
            tokens_before,
            tokens_after: history.approx_tokens(),
        });
    }

    let mut rebuilt = vec![system, ChatMessage::assistant(summary)];
    rebuilt.extend(recent.iter().cloned());
    history.replace_messages(rebuilt);

    Ok(CompactionReport {
        summarized_messages: split,
        tokens_before,
        tokens_after: history.approx_tokens(),
    })
}

fn is_tool_group_member(msg: &ChatMessage) -> bool {
    msg.role == Role::Tool || msg.tool_calls.is_some()
}

/// Deterministic fallback: drop all but the last `keep_recent` non-system
/// messages and prepend a canned notice.  Never calls the model, always
/// succeeds.  Returns the number of dropped messages.
pub fn emergency_compact(history: &mut ConversationHistory, keep_recent: usize) -> usize {
    let system = history.messages()[0].clone();
    let non_system: Vec<ChatMessage> = history
        .messages()
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    let mut split = non_system.len().saturating_sub(keep_recent.min(non_system.len()));
    while split > 0 && split < non_system.len() && is_tool_group_member(&non_system[split]) {
        split -= 1;
    }
    let dropped = split;
    let mut rebuilt = vec![system, ChatMessage::assistant(EMERGENCY_NOTICE)];
    rebuilt.extend(non_system[split..].iter().cloned());
    history.replace_messages(rebuilt);
    dropped
}

/// Serialise messages into plain text for the compaction prompt.
fn serialize_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let mut text = m.content.clone();
            if let Some(tcs) = &m.tool_calls {
                for tc in tcs {
                    text.push_str(&format!(
                        "\n[tool_call: {}({})]",
                        tc.function.name, tc.function.arguments
                    ));
                }
            }
            if let Some(name) = &m.tool_name {
                text = format!("[{name} result] {text}");
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Tool-result truncation ──────────────────────────────────────────────────

/// Bound a tool result to `cap_tokens` (4 chars/token; 0 disables) before
/// it enters the session.
///
/// The extraction strategy follows how each execution kind's output is
/// actually read back:
/// - [`ToolKind::Terminal`]: the verdict lives at the END — exit markers,
///   stderr, and the dispatcher's appended reminders all land there.  A
///   short preamble is kept and most of the budget goes to the tail.
/// - [`ToolKind::ReadOnly`]: ranked matches; keep the leading entries and
///   report how many were dropped so the model narrows the query instead
///   of re-running it.
/// - [`ToolKind::ReadFile`]: declarations up top, latest edits at the
///   bottom; head-weighted split that names the omitted line range so the
///   model can request exactly the part it is missing.
/// - [`ToolKind::SubAgent`]: synthesized prose that front-loads the
///   answer; keep the head only.
/// - anything else: cut at the nearest line boundary.
pub fn smart_truncate(content: &str, kind: ToolKind, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let budget = cap_tokens * 4;
    if content.len() <= budget {
        return content.to_string();
    }
    let total_lines = content.lines().count();

    match kind {
        ToolKind::Terminal => {
            let head_budget = budget / 4;
            let (head, head_n) = whole_lines(content, head_budget, Anchor::Start);
            let (tail, tail_n) = whole_lines(content, budget - head_budget, Anchor::End);
            let dropped = total_lines.saturating_sub(head_n + tail_n);
            if dropped == 0 || tail_n == 0 {
                // Very long lines defeated the split; keep the end, where
                // the exit status is.
                let (tail, _) = whole_lines(content, budget, Anchor::End);
                return format!("[earlier output dropped]\n{tail}");
            }
            format!("{head}\n[{dropped} lines of output dropped]\n{tail}")
        }
        ToolKind::ReadOnly => {
            let (kept, kept_n) = whole_lines(content, budget, Anchor::Start);
            let dropped = total_lines.saturating_sub(kept_n);
            format!(
                "{kept}\n[{dropped} more results not shown — narrow the query to see them]"
            )
        }
        ToolKind::ReadFile => {
            let head_budget = budget * 3 / 5;
            let (head, head_n) = whole_lines(content, head_budget, Anchor::Start);
            let (tail, tail_n) = whole_lines(content, budget - head_budget, Anchor::End);
            let dropped = total_lines.saturating_sub(head_n + tail_n);
            if dropped == 0 {
                return format!("{head}\n[rest of the file not shown]");
            }
            format!(
                "{head}\n[lines {}-{} not shown — read that range to see them]\n{tail}",
                head_n + 1,
                total_lines - tail_n,
            )
        }
        ToolKind::SubAgent => {
            let (kept, _) = whole_lines(content, budget, Anchor::Start);
            format!("{kept}\n[sub-agent findings trimmed to fit the context budget]")
        }
        _ => {
            let mut cut = budget.min(content.len());
            while cut > 0 && !content.is_char_boundary(cut) {
                cut -= 1;
            }
            let cut = content[..cut].rfind('\n').unwrap_or(cut);
            format!("{}\n[trimmed {} bytes]", &content[..cut], content.len() - cut)
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Anchor {
    Start,
    End,
}

/// Take whole lines from one end of `content` until `budget` bytes are
/// spent.  Returns the kept text and how many lines it holds.
fn whole_lines(content: &str, budget: usize, anchor: Anchor) -> (String, usize) {
    let lines: Vec<&str> = content.lines().collect();
    let iter: Box<dyn Iterator<Item = &str>> = match anchor {
        Anchor::Start => Box::new(lines.iter().copied()),
        Anchor::End => Box::new(lines.iter().rev().copied()),
    };
    let mut kept: Vec<&str> = Vec::new();
    let mut spent = 0usize;
    for line in iter {
        let cost = line.len() + 1;
        if spent + cost > budget {
            break;
        }
        spent += cost;
        kept.push(line);
    }
    if anchor == Anchor::End {
        kept.reverse();
    }
    let count = kept.len();
    (kept.join("\n"), count)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vidar_model::{ChatChunk, ScriptedMockBackend};
    use vidar_tools::ToolCall;

    fn seeded_history(pairs: usize) -> ConversationHistory {
        let mut h = ConversationHistory::new("system prompt", true);
        for i in 0..pairs {
            h.push_user(format!("question number {i} with some padding text"));
            h.add_assistant_message(&format!("answer number {i} with some padding text"), "");
        }
        h
    }

    #[tokio::test]
    async fn compaction_replaces_old_history_with_summary() {
        let backend = ScriptedMockBackend::new(vec![vec![
            ChatChunk::text("summary of the early conversation"),
            ChatChunk::done(10, 10),
        ]]);
        let mut h = seeded_history(20);
        let before = h.approx_tokens();

        let report = compact_history(&mut h, &backend, "m", 6).await.unwrap();

        assert_eq!(report.tokens_before, before);
        assert!(report.tokens_after < report.tokens_before);
        assert_eq!(report.summarized_messages, 34);
        // system prompt preserved at index 0
        assert_eq!(h.messages()[0].role, Role::System);
        assert_eq!(h.messages()[0].content, "system prompt");
        // summary sits right after the system prompt
        assert!(h.messages()[1].content.contains("summary of the early"));
        // last 6 messages preserved verbatim
        assert_eq!(h.len(), 2 + 6);
        assert!(h.messages().last().unwrap().content.contains("answer number 19"));
    }

    #[tokio::test]
    async fn split_never_orphans_a_tool_result() {
        let backend = ScriptedMockBackend::new(vec![vec![
            ChatChunk::text("summary"),
            ChatChunk::done(5, 5),
        ]]);
        let mut h = ConversationHistory::new("sys", true);
        for i in 0..6 {
            h.push_user(format!("padding message number {i}"));
            h.add_assistant_message("padding answer", "");
        }
        // A tool group right at the would-be split point.
        h.add_assistant_tool_message(&[ToolCall::from_value("grep", json!({"q": "x"}))], "", "");
        h.add_native_tool_results(&[("grep".into(), "matches".into())]);
        h.push_user("after the tool group");
        h.add_assistant_message("final answer", "");

        compact_history(&mut h, &backend, "m", 4).await.unwrap();

        // If a tool result survived, its assistant tool-call must too.
        let msgs = h.messages();
        for (i, m) in msgs.iter().enumerate() {
            if m.role == Role::Tool {
                assert!(
                    msgs[..i].iter().any(|p| p.tool_calls.is_some()),
                    "orphaned tool result at index {i}"
                );
            }
        }
    }

    #[tokio::test]
    async fn failed_model_call_falls_back_to_emergency() {
        // Empty script list → mock falls back to "[no more scripts]" text;
        // force failure instead by returning empty content.
        let backend = ScriptedMockBackend::new(vec![vec![ChatChunk::done(1, 1)]]);
        let mut h = seeded_history(10);
        let report = compact_history(&mut h, &backend, "m", 4).await.unwrap();
        assert!(h.messages()[1].content.contains("emergency-compacted"));
        assert!(report.tokens_after < report.tokens_before);
    }

    #[test]
    fn emergency_keeps_recent_tail() {
        let mut h = seeded_history(10);
        emergency_compact(&mut h, 4);
        assert_eq!(h.messages()[0].role, Role::System);
        assert!(h.messages()[1].content.contains("emergency-compacted"));
        assert_eq!(h.len(), 2 + 4);
        assert!(h.messages().last().unwrap().content.contains("answer number 9"));
    }

    // ── smart_truncate ────────────────────────────────────────────────────────

    fn make_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn truncate_passes_short_content_through() {
        assert_eq!(smart_truncate("short", ToolKind::Terminal, 100), "short");
    }

    #[test]
    fn truncate_zero_cap_disables() {
        let long = "x".repeat(10_000);
        assert_eq!(smart_truncate(&long, ToolKind::Terminal, 0), long);
    }

    #[test]
    fn terminal_keeps_a_preamble_and_a_large_tail() {
        let content = make_lines(200);
        let out = smart_truncate(&content, ToolKind::Terminal, 50);
        assert!(out.contains("line 0"));
        assert!(out.contains("line 199"));
        assert!(out.contains("lines of output dropped"));
        // Tail-weighted: the end of the output survives well past the
        // symmetric midpoint; the middle does not.
        assert!(out.contains("line 185"));
        assert!(!out.contains("line 100"));
    }

    #[test]
    fn terminal_single_long_lines_keep_the_end() {
        // Two lines, each alone over the head budget: the fallback keeps
        // the end, where the exit status lives.
        let content = format!("{}\n{}", "a".repeat(300), "x".repeat(150));
        let out = smart_truncate(&content, ToolKind::Terminal, 50);
        assert!(out.starts_with("[earlier output dropped]"));
        assert!(out.contains("xxx"));
        assert!(!out.contains("aaa"));
    }

    #[test]
    fn read_only_keeps_leading_matches_and_counts_the_rest() {
        let content = make_lines(500);
        let out = smart_truncate(&content, ToolKind::ReadOnly, 50);
        assert!(out.contains("line 0"));
        assert!(!out.contains("line 499"));
        assert!(out.contains("more results not shown"));
        assert!(out.contains("narrow the query"));
    }

    #[test]
    fn read_file_names_the_omitted_line_range() {
        let content = make_lines(1000);
        let out = smart_truncate(&content, ToolKind::ReadFile, 50);
        assert!(out.contains("line 0"));
        assert!(out.contains("line 999"));
        assert!(out.contains("not shown — read that range"));
        assert!(!out.contains("\nline 500\n"));
    }

    #[test]
    fn read_file_split_is_head_weighted() {
        let content = make_lines(1000);
        let out = smart_truncate(&content, ToolKind::ReadFile, 50);
        let notice_at = out.find("not shown").unwrap();
        let head = &out[..notice_at];
        let tail = &out[notice_at..];
        assert!(
            head.lines().count() > tail.lines().count(),
            "declarations side must get the larger share"
        );
    }

    #[test]
    fn subagent_summary_keeps_the_head_only() {
        let content = make_lines(500);
        let out = smart_truncate(&content, ToolKind::SubAgent, 50);
        assert!(out.contains("line 0"));
        assert!(!out.contains("line 499"));
        assert!(out.contains("findings trimmed"));
    }

    #[test]
    fn generic_cuts_at_line_boundary() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(200));
        let out = smart_truncate(&content, ToolKind::Other, 5);
        assert!(!out.contains("bbb"));
        assert!(out.contains("trimmed"));
    }
}
