// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vidar_config::{AgentMode, SessionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Generating,
    Completed,
    Cancelled,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Generating => "generating",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One agent session.  Created on first user input; mutated only by the
/// agent loop and user commands.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub task: String,
    pub mode: AgentMode,
    pub model: String,
    pub status: SessionStatus,
    pub workspace: PathBuf,
    pub options: SessionOptions,
}

impl Session {
    pub fn new(
        task: impl Into<String>,
        mode: AgentMode,
        model: impl Into<String>,
        workspace: impl Into<PathBuf>,
        options: SessionOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task: task.into(),
            mode,
            model: model.into(),
            status: SessionStatus::Idle,
            workspace: workspace.into(),
            options,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sess() -> Session {
        Session::new(
            "do something",
            AgentMode::Agent,
            "test-model",
            "/tmp/ws",
            SessionOptions::default(),
        )
    }

    #[test]
    fn new_sessions_have_unique_ids() {
        assert_ne!(sess().id, sess().id);
    }

    #[test]
    fn new_session_starts_idle() {
        assert_eq!(sess().status, SessionStatus::Idle);
    }

    #[test]
    fn status_display_is_lowercase() {
        assert_eq!(SessionStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(SessionStatus::Error.to_string(), "error");
    }
}
