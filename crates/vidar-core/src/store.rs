// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Narrow append-oriented persistence interface.
//!
//! The real store lives outside the core (a database owned by the editor
//! host); [`MemoryStore`] is the in-process implementation used by tests
//! and the headless CLI.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::SessionStatus;

/// `tool_name` marker for persisted UI events.  Records carrying it are
/// replayed into the UI timeline on session reload and are never part of
/// the model-visible history.
pub const UI_EVENT_MARKER: &str = "__ui__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub tool_calls: Option<Value>,
    pub progress_title: Option<String>,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Optional fields of [`SessionStore::add_message`].
#[derive(Debug, Clone, Default)]
pub struct AddMessage {
    pub model: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub tool_calls: Option<Value>,
    pub progress_title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub task: String,
    pub model: String,
    pub status: SessionStatus,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotAction {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub path: String,
    pub original_content: Option<String>,
    pub action: SnapshotAction,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        task: &str,
        model: &str,
        workspace: &Path,
    ) -> anyhow::Result<String>;

    async fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        opts: AddMessage,
    ) -> anyhow::Result<MessageRecord>;

    async fn update_session(&self, id: &str, patch: SessionPatch) -> anyhow::Result<()>;

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<SessionRecord>>;

    async fn create_checkpoint(&self, session_id: &str) -> anyhow::Result<String>;

    async fn snapshot_file(
        &self,
        checkpoint_id: &str,
        path: &str,
        original_content: Option<String>,
        action: SnapshotAction,
    ) -> anyhow::Result<()>;

    async fn save_session_memory(&self, session_id: &str, json: &str) -> anyhow::Result<()>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStoreInner {
    sessions: HashMap<String, SessionRecord>,
    messages: Vec<MessageRecord>,
    checkpoints: HashMap<String, Vec<FileSnapshot>>,
    session_memory: HashMap<String, String>,
}

/// In-memory [`SessionStore`].  Writes are serialized by the inner mutex,
/// matching the per-session write serialization of the real store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted messages, in append order.
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Persisted UI-event records only, in append order.
    pub fn ui_events(&self) -> Vec<MessageRecord> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.tool_name.as_deref() == Some(UI_EVENT_MARKER))
            .cloned()
            .collect()
    }

    /// Every snapshot across all checkpoints, in creation order.
    pub fn all_snapshots(&self) -> Vec<FileSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect()
    }

    pub fn snapshots(&self, checkpoint_id: &str) -> Vec<FileSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .get(checkpoint_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_memory(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .session_memory
            .get(session_id)
            .cloned()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        task: &str,
        model: &str,
        _workspace: &Path,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.inner.lock().unwrap().sessions.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                task: task.to_string(),
                model: model.to_string(),
                status: SessionStatus::Idle,
                title: None,
            },
        );
        Ok(id)
    }

    async fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        opts: AddMessage,
    ) -> anyhow::Result<MessageRecord> {
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            tool_name: opts.tool_name,
            tool_input: opts.tool_input,
            tool_output: opts.tool_output,
            tool_calls: opts.tool_calls,
            progress_title: opts.progress_title,
            model: opts.model,
            timestamp: Utc::now(),
        };
        self.inner.lock().unwrap().messages.push(record.clone());
        Ok(record)
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rec) = inner.sessions.get_mut(id) {
            if let Some(status) = patch.status {
                rec.status = status;
            }
            if let Some(title) = patch.title {
                rec.title = Some(title);
            }
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.inner.lock().unwrap().sessions.get(id).cloned())
    }

    async fn create_checkpoint(&self, _session_id: &str) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn snapshot_file(
        &self,
        checkpoint_id: &str,
        path: &str,
        original_content: Option<String>,
        action: SnapshotAction,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .checkpoints
            .entry(checkpoint_id.to_string())
            .or_default()
            .push(FileSnapshot {
                path: path.to_string(),
                original_content,
                action,
            });
        Ok(())
    }

    async fn save_session_memory(&self, session_id: &str, json: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .session_memory
            .insert(session_id.to_string(), json.to_string());
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
