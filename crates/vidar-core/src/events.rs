// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! UI event catalog and the persist-then-publish event bus.
//!
//! Every event that must survive a session reload goes through
//! [`EventBus::emit`], which writes a `__ui__` marker record to the store
//! BEFORE publishing to the sink.  If the process dies between the two, the
//! next session load still reconstructs the timeline from the store.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::approval::ApprovalRequest;
use crate::store::{AddMessage, SessionStore, UI_EVENT_MARKER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Running,
    Success,
    Error,
}

/// Everything the presentation layer can be told.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UiEvent {
    ShowThinking,
    StreamThinking {
        text: String,
    },
    StreamChunk {
        text: String,
    },
    CollapseThinking {
        elapsed_ms: u64,
    },
    HideThinking,
    ShowToolAction {
        id: String,
        tool: String,
        title: String,
        status: ActionStatus,
    },
    StartProgressGroup {
        title: String,
    },
    FinishProgressGroup,
    IterationBoundary {
        iteration: u32,
        max_iterations: u32,
    },
    RequestToolApproval {
        approval: ApprovalRequest,
    },
    ToolApprovalResult {
        id: String,
        approved: bool,
    },
    FilesChanged {
        files: Vec<String>,
    },
    FinalMessage {
        text: String,
    },
    ThinkingBlock {
        text: String,
    },
    SubagentThinking {
        text: String,
    },
    TokenUsage {
        prompt: u32,
        completion: u32,
        window: u32,
    },
    ShowError {
        message: String,
    },
    ShowWarningBanner {
        message: String,
    },
}

impl UiEvent {
    /// Events that still reach the sink when the loop is quarantined
    /// (sub-agent runs show only their tool actions, inside one group).
    fn passes_quarantine(&self) -> bool {
        matches!(
            self,
            UiEvent::ShowToolAction { .. }
                | UiEvent::StartProgressGroup { .. }
                | UiEvent::FinishProgressGroup
        )
    }
}

/// Event sink of the presentation layer.  Must not block.
pub trait UiSink: Send + Sync {
    fn post_message(&self, session_id: &str, event: &UiEvent);
}

/// Sink that forwards every event into an unbounded channel — the default
/// for tests and the headless CLI.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UiSink for ChannelSink {
    fn post_message(&self, _session_id: &str, event: &UiEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl UiSink for NullSink {
    fn post_message(&self, _session_id: &str, _event: &UiEvent) {}
}

/// The only path through which components talk to the UI.
#[derive(Clone)]
pub struct EventBus {
    session_id: String,
    store: Arc<dyn SessionStore>,
    ui: Arc<dyn UiSink>,
    quarantined: bool,
}

impl EventBus {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        ui: Arc<dyn UiSink>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            ui,
            quarantined: false,
        }
    }

    /// A bus for a sub-agent: everything still persists, but only
    /// tool-action events are published.
    pub fn quarantined(&self) -> Self {
        Self {
            quarantined: true,
            ..self.clone()
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Persist, then publish.  Use for every event that must be visible in
    /// reloaded session history.  A failed persist suppresses the publish —
    /// the ordering invariant beats liveness of a single spinner.
    pub async fn emit(&self, event: UiEvent) {
        if let Err(e) = self.persist(&event).await {
            warn!(error = %e, "failed to persist UI event; suppressing publish");
            return;
        }
        self.publish(&event);
    }

    /// Publish only — transient hints (spinners, stream deltas, iteration
    /// boundaries) that are rebuilt live and never replayed.
    pub fn post(&self, event: UiEvent) {
        self.publish(&event);
    }

    /// Persist only.
    pub async fn persist(&self, event: &UiEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        self.store
            .add_message(
                &self.session_id,
                "assistant",
                "",
                AddMessage {
                    tool_name: Some(UI_EVENT_MARKER.to_string()),
                    tool_output: Some(payload),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    fn publish(&self, event: &UiEvent) {
        if self.quarantined && !event.passes_quarantine() {
            return;
        }
        self.ui.post_message(&self.session_id, event);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
