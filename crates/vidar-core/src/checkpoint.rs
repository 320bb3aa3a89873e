// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lazy per-file snapshots backing undo.
//!
//! A checkpoint is created at the start of an agent turn; each file is
//! snapshotted at most once, the first time a write touches it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::host::HostEnvironment;
use crate::store::{SessionStore, SnapshotAction};

pub struct CheckpointManager {
    checkpoint_id: String,
    store: Arc<dyn SessionStore>,
    /// path → content before the first write this turn (None = file did
    /// not exist).
    originals: Mutex<HashMap<String, Option<String>>>,
}

impl CheckpointManager {
    pub async fn create(
        store: Arc<dyn SessionStore>,
        session_id: &str,
    ) -> anyhow::Result<Self> {
        let checkpoint_id = store.create_checkpoint(session_id).await?;
        Ok(Self {
            checkpoint_id,
            store,
            originals: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.checkpoint_id
    }

    /// Snapshot `path` before a write, once.  Returns the original content
    /// (None when the file is being created) for diff computation.
    pub async fn snapshot_before_write(
        &self,
        host: &dyn HostEnvironment,
        path: &str,
    ) -> anyhow::Result<Option<String>> {
        let mut originals = self.originals.lock().await;
        if let Some(existing) = originals.get(path) {
            return Ok(existing.clone());
        }
        let original = host.read_file(path).await.ok();
        let action = if original.is_some() {
            SnapshotAction::Modified
        } else {
            SnapshotAction::Created
        };
        self.store
            .snapshot_file(&self.checkpoint_id, path, original.clone(), action)
            .await?;
        originals.insert(path.to_string(), original.clone());
        Ok(original)
    }

    /// Record a deletion snapshot.
    pub async fn snapshot_before_delete(
        &self,
        host: &dyn HostEnvironment,
        path: &str,
    ) -> anyhow::Result<()> {
        let mut originals = self.originals.lock().await;
        if originals.contains_key(path) {
            return Ok(());
        }
        let original = host.read_file(path).await.ok();
        self.store
            .snapshot_file(&self.checkpoint_id, path, original.clone(), SnapshotAction::Deleted)
            .await?;
        originals.insert(path.to_string(), original);
        Ok(())
    }

    /// Paths touched so far this turn.
    pub async fn touched_paths(&self) -> Vec<String> {
        self.originals.lock().await.keys().cloned().collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHost;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn first_write_snapshots_original_content() {
        let store = Arc::new(MemoryStore::new());
        let host = MockHost::new().with_file("a.rs", "original");
        let cp = CheckpointManager::create(store.clone(), "s").await.unwrap();

        let orig = cp.snapshot_before_write(&host, "a.rs").await.unwrap();
        assert_eq!(orig.as_deref(), Some("original"));

        let snaps = store.snapshots(cp.id());
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].action, SnapshotAction::Modified);
        assert_eq!(snaps[0].original_content.as_deref(), Some("original"));
    }

    #[tokio::test]
    async fn missing_file_snapshots_as_created() {
        let store = Arc::new(MemoryStore::new());
        let host = MockHost::new();
        let cp = CheckpointManager::create(store.clone(), "s").await.unwrap();

        let orig = cp.snapshot_before_write(&host, "new.rs").await.unwrap();
        assert!(orig.is_none());
        assert_eq!(store.snapshots(cp.id())[0].action, SnapshotAction::Created);
    }

    #[tokio::test]
    async fn second_write_does_not_resnapshot() {
        let store = Arc::new(MemoryStore::new());
        let host = MockHost::new().with_file("a.rs", "v1");
        let cp = CheckpointManager::create(store.clone(), "s").await.unwrap();

        cp.snapshot_before_write(&host, "a.rs").await.unwrap();
        host.write_file("a.rs", "v2").await.unwrap();
        let orig = cp.snapshot_before_write(&host, "a.rs").await.unwrap();

        // Still the pre-turn content, and still a single snapshot record.
        assert_eq!(orig.as_deref(), Some("v1"));
        assert_eq!(store.snapshots(cp.id()).len(), 1);
    }

    #[tokio::test]
    async fn delete_snapshot_records_action() {
        let store = Arc::new(MemoryStore::new());
        let host = MockHost::new().with_file("gone.rs", "bye");
        let cp = CheckpointManager::create(store.clone(), "s").await.unwrap();
        cp.snapshot_before_delete(&host, "gone.rs").await.unwrap();
        assert_eq!(store.snapshots(cp.id())[0].action, SnapshotAction::Deleted);
    }

    #[tokio::test]
    async fn touched_paths_accumulate() {
        let store = Arc::new(MemoryStore::new());
        let host = MockHost::new();
        let cp = CheckpointManager::create(store, "s").await.unwrap();
        cp.snapshot_before_write(&host, "a.rs").await.unwrap();
        cp.snapshot_before_write(&host, "b.rs").await.unwrap();
        let mut paths = cp.touched_paths().await;
        paths.sort();
        assert_eq!(paths, vec!["a.rs", "b.rs"]);
    }
}
