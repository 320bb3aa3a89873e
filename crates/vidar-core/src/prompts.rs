// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System prompt assembly per executor mode.

use vidar_config::AgentMode;

const SHARED_RULES: &str = "\
Rules:
- Work iteratively: reason, call tools, then act on their results.
- Call tools through the provided protocol only; never describe a call in prose.
- Never invent file contents — read before you claim.
- When the task is fully done, reply with the single token [TASK_COMPLETE].
- Do not announce completion in any other words; only [TASK_COMPLETE] ends the task.";

fn mode_preamble(mode: AgentMode) -> &'static str {
    match mode {
        AgentMode::Explore => {
            "You are a code exploration agent. Investigate the workspace and \
             report what you find. You cannot modify anything."
        }
        AgentMode::Plan => {
            "You are a planning agent. Study the workspace and produce a concrete, \
             step-by-step implementation plan. You cannot modify anything."
        }
        AgentMode::Chat => {
            "You are a coding assistant answering questions about this workspace. \
             Read what you need; you cannot modify anything."
        }
        AgentMode::Review => {
            "You are a code review agent. Read the code, run checks where useful, \
             and report problems with file and line references."
        }
        AgentMode::DeepExplore => {
            "You are an exploration orchestrator. Investigate the workspace, \
             delegating focused sub-questions to sub-agents where that is faster."
        }
        AgentMode::DeepExploreWrite => {
            "You are an exploration orchestrator that may also write files. \
             Delegate focused reading to sub-agents; make edits yourself."
        }
        AgentMode::Agent => {
            "You are an autonomous coding agent. You write files and run commands \
             directly; delegate all code reading and searching to sub-agents via \
             run_subagent so your own context stays small."
        }
    }
}

pub fn system_prompt(
    mode: AgentMode,
    custom: Option<&str>,
    workspace: &str,
    allowed_tools: &[&str],
) -> String {
    if let Some(custom) = custom {
        return custom.to_string();
    }
    format!(
        "{}\n\nWorkspace: {}\nAvailable tools: {}\n\n{}",
        mode_preamble(mode),
        workspace,
        allowed_tools.join(", "),
        SHARED_RULES
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_tools_and_workspace() {
        let p = system_prompt(AgentMode::Explore, None, "/ws", &["read_file", "grep"]);
        assert!(p.contains("/ws"));
        assert!(p.contains("read_file, grep"));
        assert!(p.contains("[TASK_COMPLETE]"));
    }

    #[test]
    fn custom_prompt_replaces_everything() {
        let p = system_prompt(AgentMode::Agent, Some("do as I say"), "/ws", &["x"]);
        assert_eq!(p, "do as I say");
    }

    #[test]
    fn each_mode_has_distinct_preamble() {
        let modes = [
            AgentMode::Explore,
            AgentMode::Plan,
            AgentMode::Chat,
            AgentMode::Review,
            AgentMode::DeepExplore,
            AgentMode::DeepExploreWrite,
            AgentMode::Agent,
        ];
        let prompts: Vec<&str> = modes.iter().map(|m| mode_preamble(*m)).collect();
        for (i, a) in prompts.iter().enumerate() {
            for b in prompts.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
