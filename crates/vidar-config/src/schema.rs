// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name forwarded to the Ollama API (e.g. "qwen2.5-coder:14b").
    pub name: String,
    /// Base URL of the Ollama-compatible server.
    pub base_url: String,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to generate in a single completion (num_predict).
    pub num_predict: Option<u32>,
    /// Keep-alive duration forwarded to the server (e.g. "10m").
    pub keep_alive: Option<String>,
    /// Override the detected context window for this model.  Takes
    /// precedence over the value reported by `show_model`, but is still
    /// subject to the global cap in [`ContextConfig`].
    pub context_length: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "qwen2.5-coder:14b".into(),
            base_url: "http://localhost:11434".into(),
            temperature: Some(0.2),
            num_predict: Some(4096),
            keep_alive: Some("10m".into()),
            context_length: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    25
}
fn default_subagent_max_iterations() -> u32 {
    12
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_tool_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default mode when none is specified on the CLI.
    #[serde(default = "default_agent_mode")]
    pub default_mode: AgentMode,
    /// Maximum number of reason→act iterations before the loop stops.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Iteration cap for delegated sub-agent runs.
    #[serde(default = "default_subagent_max_iterations")]
    pub subagent_max_iterations: u32,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session.
    /// 0 disables per-result truncation entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Per-tool timeout in seconds, enforced by the host where supported.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_agent_mode() -> AgentMode {
    AgentMode::Agent
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_mode: AgentMode::Agent,
            max_iterations: default_max_iterations(),
            subagent_max_iterations: default_subagent_max_iterations(),
            tool_result_token_cap: default_tool_result_token_cap(),
            tool_timeout_secs: default_tool_timeout_secs(),
            system_prompt: None,
        }
    }
}

fn default_global_context_cap() -> u32 {
    65_536
}
fn default_compaction_threshold() -> f32 {
    0.75
}
fn default_compaction_keep_recent() -> usize {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Global upper bound on the effective context window, regardless of
    /// what the model reports.  Protects slow local machines from loading
    /// a 128k-token KV cache.
    #[serde(default = "default_global_context_cap")]
    pub global_cap: u32,
    /// Token fraction at which history compaction triggers (0.0–1.0).
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of recent non-system messages preserved verbatim during
    /// compaction.  Everything older is summarised by the model.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            global_cap: default_global_context_cap(),
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Auto-approve terminal commands (critical severity still prompts).
    #[serde(default)]
    pub auto_approve_commands: bool,
    /// Auto-approve edits to files matching `sensitive_file_patterns`.
    #[serde(default)]
    pub auto_approve_sensitive_edits: bool,
    /// Glob patterns for files whose edits require approval.
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_file_patterns: Vec<String>,
    /// Whether edits snapshot into a checkpoint for per-file undo.
    #[serde(default = "default_true")]
    pub checkpoint_edits: bool,
}

fn default_sensitive_patterns() -> Vec<String> {
    vec![
        "*.env".into(),
        ".env*".into(),
        "*.pem".into(),
        "*.key".into(),
        "**/secrets/**".into(),
        "Cargo.lock".into(),
        "package-lock.json".into(),
    ]
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve_commands: false,
            auto_approve_sensitive_edits: false,
            sensitive_file_patterns: default_sensitive_patterns(),
            checkpoint_edits: true,
        }
    }
}

/// Per-session approval switches, copied from [`ApprovalConfig`] at session
/// creation and mutable afterwards by user commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub auto_approve_commands: bool,
    pub auto_approve_sensitive_edits: bool,
    pub sensitive_file_patterns: Vec<String>,
}

impl From<&ApprovalConfig> for SessionOptions {
    fn from(cfg: &ApprovalConfig) -> Self {
        Self {
            auto_approve_commands: cfg.auto_approve_commands,
            auto_approve_sensitive_edits: cfg.auto_approve_sensitive_edits,
            sensitive_file_patterns: cfg.sensitive_file_patterns.clone(),
        }
    }
}

/// Executor mode — selects the allowed tool set and the loop behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    /// Read-only exploration of the workspace.
    Explore,
    /// Produce a structured plan; no code changes.
    Plan,
    /// Conversational Q&A over the workspace, read-only.
    Chat,
    /// Read-only review that may also run terminal commands.
    Review,
    /// Exploration that can delegate to sub-agents.
    DeepExplore,
    /// Exploration with sub-agents plus write access.
    DeepExploreWrite,
    /// Full agent: writes, terminal, sub-agent delegation.
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentMode::Explore => "explore",
            AgentMode::Plan => "plan",
            AgentMode::Chat => "chat",
            AgentMode::Review => "review",
            AgentMode::DeepExplore => "deep-explore",
            AgentMode::DeepExploreWrite => "deep-explore-write",
            AgentMode::Agent => "agent",
        };
        write!(f, "{s}")
    }
}

impl AgentMode {
    /// Modes whose loop may modify files.
    pub fn allows_writes(&self) -> bool {
        matches!(self, AgentMode::Agent | AgentMode::DeepExploreWrite)
    }

    /// Modes that may delegate to a sub-agent.
    pub fn allows_subagents(&self) -> bool {
        matches!(
            self,
            AgentMode::Agent | AgentMode::DeepExplore | AgentMode::DeepExploreWrite
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
