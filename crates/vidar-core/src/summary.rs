// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Post-loop closeout: the final summary ladder and session titles.

use std::time::Duration;

use tracing::debug;
use vidar_model::{ChatBackend, ChatMessage, ChatRequest};

/// How many recent tool outputs feed the fallback summary prompt.
const SUMMARY_TOOL_OUTPUTS: usize = 6;
/// Per-output cap in the fallback prompt.
const SUMMARY_OUTPUT_CHARS: usize = 1_500;
const TITLE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SummaryInput<'a> {
    /// Model text already streamed to the user this turn.
    pub streamed_text: &'a str,
    /// `(tool_name, output)` pairs in execution order.
    pub tool_outputs: &'a [(String, String)],
    pub condensed_thinking: &'a str,
    pub files_modified: &'a [String],
}

/// Build the final user-facing explanation.  Ladder, stopping at the first
/// non-empty rung: streamed text → one model call → tool bullet list →
/// generic.
pub async fn build_final_summary(
    backend: &dyn ChatBackend,
    model: &str,
    input: &SummaryInput<'_>,
) -> String {
    let explanation = if !input.streamed_text.trim().is_empty() {
        input.streamed_text.trim().to_string()
    } else if let Some(text) = model_summary(backend, model, input).await {
        text
    } else if !input.tool_outputs.is_empty() {
        bullet_list(input.tool_outputs)
    } else {
        "Task completed successfully.".to_string()
    };

    if input.files_modified.is_empty() {
        explanation
    } else {
        format!(
            "**{} file{} modified**\n\n{}",
            input.files_modified.len(),
            if input.files_modified.len() == 1 { "" } else { "s" },
            explanation
        )
    }
}

async fn model_summary(
    backend: &dyn ChatBackend,
    model: &str,
    input: &SummaryInput<'_>,
) -> Option<String> {
    if input.tool_outputs.is_empty() && input.condensed_thinking.trim().is_empty() {
        return None;
    }
    let mut prompt = String::from(
        "Summarise in 2-4 sentences what was just accomplished, for the user. \
         Plain prose, no tool syntax.\n\n",
    );
    let start = input.tool_outputs.len().saturating_sub(SUMMARY_TOOL_OUTPUTS);
    for (name, output) in &input.tool_outputs[start..] {
        let capped = if output.len() > SUMMARY_OUTPUT_CHARS {
            &output[..SUMMARY_OUTPUT_CHARS]
        } else {
            output
        };
        prompt.push_str(&format!("[{name}]\n{capped}\n\n"));
    }
    if !input.condensed_thinking.trim().is_empty() {
        let t = input.condensed_thinking.trim();
        let capped = if t.len() > SUMMARY_OUTPUT_CHARS {
            &t[..SUMMARY_OUTPUT_CHARS]
        } else {
            t
        };
        prompt.push_str(&format!("[reasoning]\n{capped}\n"));
    }

    let req = ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        stream: false,
        ..Default::default()
    };
    match backend.chat_no_stream(req).await {
        Ok(resp) => resp
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.trim().to_string()),
        Err(e) => {
            debug!(error = %e, "fallback summary call failed");
            None
        }
    }
}

fn bullet_list(tool_outputs: &[(String, String)]) -> String {
    let start = tool_outputs.len().saturating_sub(SUMMARY_TOOL_OUTPUTS);
    let mut out = String::from("Actions taken:\n");
    for (name, _) in &tool_outputs[start..] {
        out.push_str(&format!("- {name}\n"));
    }
    out.trim_end().to_string()
}

/// One-shot session title, raced against a 15 s timeout.  `None` on
/// timeout or failure — the caller keeps the task text as the title.
pub async fn generate_title(backend: &dyn ChatBackend, model: &str, task: &str) -> Option<String> {
    let req = ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user(format!(
            "Write a 3-6 word title for this coding task. Title only, no quotes.\n\n{task}"
        ))],
        stream: false,
        ..Default::default()
    };
    let call = backend.chat_no_stream(req);
    match tokio::time::timeout(TITLE_TIMEOUT, call).await {
        Ok(Ok(resp)) => resp
            .message
            .content
            .map(|c| c.trim().trim_matches('"').to_string())
            .filter(|c| !c.is_empty()),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vidar_model::{ChatChunk, ScriptedMockBackend};

    fn outputs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn streamed_text_wins_the_ladder() {
        let backend = ScriptedMockBackend::always_text("should not be called");
        let input = SummaryInput {
            streamed_text: "I fixed the bug in foo().",
            tool_outputs: &outputs(&[("write_file", "ok")]),
            condensed_thinking: "",
            files_modified: &[],
        };
        let s = build_final_summary(&backend, "m", &input).await;
        assert_eq!(s, "I fixed the bug in foo().");
        assert!(backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_call_used_when_no_streamed_text() {
        let backend = ScriptedMockBackend::always_text("Read two files and patched one.");
        let input = SummaryInput {
            streamed_text: "",
            tool_outputs: &outputs(&[("read_file", "content")]),
            condensed_thinking: "thought about it",
            files_modified: &[],
        };
        let s = build_final_summary(&backend, "m", &input).await;
        assert_eq!(s, "Read two files and patched one.");
    }

    #[tokio::test]
    async fn bullet_list_when_model_returns_nothing() {
        // Script returns empty content → ladder falls to the bullet list.
        let backend = ScriptedMockBackend::new(vec![vec![ChatChunk::done(1, 1)]]);
        let input = SummaryInput {
            streamed_text: "",
            tool_outputs: &outputs(&[("grep", "m1"), ("read_file", "c")]),
            condensed_thinking: "",
            files_modified: &[],
        };
        let s = build_final_summary(&backend, "m", &input).await;
        assert!(s.contains("- grep"));
        assert!(s.contains("- read_file"));
    }

    #[tokio::test]
    async fn generic_fallback_when_nothing_happened() {
        let backend = ScriptedMockBackend::new(vec![]);
        let input = SummaryInput {
            streamed_text: "",
            tool_outputs: &[],
            condensed_thinking: "",
            files_modified: &[],
        };
        let s = build_final_summary(&backend, "m", &input).await;
        assert_eq!(s, "Task completed successfully.");
    }

    #[tokio::test]
    async fn files_modified_prefix_applied() {
        let backend = ScriptedMockBackend::new(vec![]);
        let files = vec!["a.rs".to_string(), "b.rs".to_string()];
        let input = SummaryInput {
            streamed_text: "Done.",
            tool_outputs: &[],
            condensed_thinking: "",
            files_modified: &files,
        };
        let s = build_final_summary(&backend, "m", &input).await;
        assert!(s.starts_with("**2 files modified**\n\n"));
    }

    #[tokio::test]
    async fn title_comes_from_model() {
        let backend = ScriptedMockBackend::always_text("Fix login crash");
        let t = generate_title(&backend, "m", "fix the crash when logging in").await;
        assert_eq!(t.as_deref(), Some("Fix login crash"));
    }

    #[tokio::test]
    async fn empty_title_is_none() {
        let backend = ScriptedMockBackend::new(vec![vec![ChatChunk::done(1, 1)]]);
        let t = generate_title(&backend, "m", "task").await;
        assert!(t.is_none());
    }
}
