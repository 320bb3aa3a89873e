// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Human approval gate for dangerous tool calls.
//!
//! Each pending approval pairs an id with a oneshot resolver.  The waiting
//! side suspends until the user responds or the cancellation handle fires;
//! cancellation resolves every pending approval as denied.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use vidar_tools::Severity;

use crate::events::{EventBus, UiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Terminal,
    FileEdit,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub kind: ApprovalKind,
    pub payload: Value,
    /// Already clamped for display (never below medium).
    pub severity: Severity,
}

impl ApprovalRequest {
    pub fn new(kind: ApprovalKind, payload: Value, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            severity: vidar_tools::displayed_severity(severity),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub revised_command: Option<String>,
}

#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalResponse>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the approval request and suspend until the user responds or
    /// `cancel` fires.  Cancellation resolves as denied.
    pub async fn request(
        &self,
        bus: &EventBus,
        approval: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> ApprovalResponse {
        let id = approval.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        bus.emit(UiEvent::RequestToolApproval {
            approval: approval.clone(),
        })
        .await;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                ApprovalResponse::default()
            }
            r = rx => r.unwrap_or_default(),
        };

        bus.post(UiEvent::ToolApprovalResult {
            id,
            approved: response.approved,
        });
        response
    }

    /// Resolve a pending approval.  Returns `false` when the id is unknown
    /// (already resolved, or cancelled).
    pub fn handle_response(
        &self,
        id: &str,
        approved: bool,
        revised_command: Option<String>,
    ) -> bool {
        match self.pending.lock().unwrap().remove(id) {
            Some(tx) => tx
                .send(ApprovalResponse {
                    approved,
                    revised_command,
                })
                .is_ok(),
            None => {
                debug!(id, "approval response for unknown id");
                false
            }
        }
    }

    /// Resolve every pending approval as denied.  Idempotent.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(ApprovalResponse::default());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::ChannelSink;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn bus() -> (EventBus, tokio::sync::mpsc::UnboundedReceiver<UiEvent>) {
        let (sink, rx) = ChannelSink::new();
        (
            EventBus::new("s", Arc::new(MemoryStore::new()), Arc::new(sink)),
            rx,
        )
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest::new(
            ApprovalKind::Terminal,
            json!({"command": "rm -rf /tmp/x"}),
            Severity::High,
        )
    }

    #[tokio::test]
    async fn approval_resolves_when_user_responds() {
        let gate = Arc::new(ApprovalGate::new());
        let (bus, mut rx) = bus();
        let approval = request();
        let id = approval.id.clone();

        let g = gate.clone();
        let waiter =
            tokio::spawn(async move { g.request(&bus, approval, &CancellationToken::new()).await });

        // The request event must have been published before resolution.
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, UiEvent::RequestToolApproval { .. }));

        assert!(gate.handle_response(&id, true, Some("rm -r /tmp/x".into())));
        let resp = waiter.await.unwrap();
        assert!(resp.approved);
        assert_eq!(resp.revised_command.as_deref(), Some("rm -r /tmp/x"));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_resolves_as_denied() {
        let gate = Arc::new(ApprovalGate::new());
        let (bus, _rx) = bus();
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.request(&bus, request(), &c).await });

        tokio::task::yield_now().await;
        cancel.cancel();
        let resp = waiter.await.unwrap();
        assert!(!resp.approved);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_denies_every_pending() {
        let gate = Arc::new(ApprovalGate::new());
        let (bus, _rx) = bus();
        let bus2 = bus.clone();
        let g1 = gate.clone();
        let g2 = gate.clone();
        let w1 =
            tokio::spawn(
                async move { g1.request(&bus, request(), &CancellationToken::new()).await },
            );
        let w2 = tokio::spawn(async move {
            g2.request(&bus2, request(), &CancellationToken::new()).await
        });

        // Give both waiters a chance to register.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.cancel_all();
        assert!(!w1.await.unwrap().approved);
        assert!(!w2.await.unwrap().approved);
        // Idempotent.
        gate.cancel_all();
    }

    #[test]
    fn response_for_unknown_id_is_rejected() {
        let gate = ApprovalGate::new();
        assert!(!gate.handle_response("nope", true, None));
    }

    #[test]
    fn request_clamps_displayed_severity() {
        let r = ApprovalRequest::new(ApprovalKind::FileEdit, json!({}), Severity::None);
        assert_eq!(r.severity, Severity::Medium);
        let r = ApprovalRequest::new(ApprovalKind::Terminal, json!({}), Severity::Critical);
        assert_eq!(r.severity, Severity::Critical);
    }
}
