// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Capability interface over the editor host.
//!
//! The real host (workspace, file I/O, diagnostics) lives outside the core.
//! [`LocalHost`] is a plain-filesystem implementation for the headless CLI;
//! [`MockHost`] is the scriptable implementation used by tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
    Hint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub line: u32,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, line: u32) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            message: message.into(),
            line,
        }
    }
}

/// Keep only error-severity diagnostics.
pub fn error_diagnostics(diags: &[Diagnostic]) -> Vec<&Diagnostic> {
    diags
        .iter()
        .filter(|d| d.severity == DiagnosticSeverity::Error)
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub mtime_ms: u64,
}

#[async_trait]
pub trait HostEnvironment: Send + Sync {
    fn workspace_root(&self) -> PathBuf;

    fn as_relative_path(&self, path: &str) -> String {
        let root = self.workspace_root();
        Path::new(path)
            .strip_prefix(&root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    fn active_editor_path(&self) -> Option<String> {
        None
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;

    async fn stat(&self, path: &str) -> anyhow::Result<FileStat>;

    /// Wait up to `timeout_ms` for fresh diagnostics on `path`.  Hosts
    /// without a language server return an empty list immediately.
    async fn wait_for_diagnostics(&self, path: &str, timeout_ms: u64) -> Vec<Diagnostic>;
}

// ─── Plain filesystem host ───────────────────────────────────────────────────

/// Filesystem-backed host for headless runs.  No diagnostics provider.
pub struct LocalHost {
    root: PathBuf,
}

impl LocalHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

#[async_trait]
impl HostEnvironment for LocalHost {
    fn workspace_root(&self) -> PathBuf {
        self.root.clone()
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(full, content).await?)
    }

    async fn stat(&self, path: &str) -> anyhow::Result<FileStat> {
        let meta = tokio::fs::metadata(self.resolve(path)).await?;
        let mtime_ms = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(FileStat { mtime_ms })
    }

    async fn wait_for_diagnostics(&self, _path: &str, _timeout_ms: u64) -> Vec<Diagnostic> {
        Vec::new()
    }
}

// ─── Scriptable host for tests ───────────────────────────────────────────────

/// In-memory host.  Diagnostics are scripted as a per-path queue: each
/// `wait_for_diagnostics` call pops the next entry, so tests can model
/// "errors after the first write, clean after the fix".
#[derive(Default)]
pub struct MockHost {
    files: Mutex<HashMap<String, String>>,
    diagnostics: Mutex<HashMap<String, Vec<Vec<Diagnostic>>>>,
    mtimes: Mutex<HashMap<String, u64>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Queue a diagnostics batch for `path`; batches pop in FIFO order.
    pub fn push_diagnostics(&self, path: &str, diags: Vec<Diagnostic>) {
        self.diagnostics
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(diags);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn set_mtime(&self, path: &str, mtime_ms: u64) {
        self.mtimes
            .lock()
            .unwrap()
            .insert(path.to_string(), mtime_ms);
    }
}

#[async_trait]
impl HostEnvironment for MockHost {
    fn workspace_root(&self) -> PathBuf {
        PathBuf::from("/workspace")
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {path}"))
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<FileStat> {
        let mtimes = self.mtimes.lock().unwrap();
        let files = self.files.lock().unwrap();
        if !files.contains_key(path) && !mtimes.contains_key(path) {
            anyhow::bail!("no such file: {path}");
        }
        Ok(FileStat {
            mtime_ms: mtimes.get(path).copied().unwrap_or(0),
        })
    }

    async fn wait_for_diagnostics(&self, path: &str, _timeout_ms: u64) -> Vec<Diagnostic> {
        let mut map = self.diagnostics.lock().unwrap();
        match map.get_mut(path) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_host_file_round_trip() {
        let host = MockHost::new();
        host.write_file("src/a.rs", "fn main() {}").await.unwrap();
        assert_eq!(host.read_file("src/a.rs").await.unwrap(), "fn main() {}");
    }

    #[tokio::test]
    async fn mock_host_missing_file_errors() {
        let host = MockHost::new();
        assert!(host.read_file("nope.rs").await.is_err());
    }

    #[tokio::test]
    async fn diagnostics_queue_pops_fifo() {
        let host = MockHost::new();
        host.push_diagnostics("a.rs", vec![Diagnostic::error("broken", 3)]);
        host.push_diagnostics("a.rs", vec![]);
        let first = host.wait_for_diagnostics("a.rs", 100).await;
        assert_eq!(first.len(), 1);
        let second = host.wait_for_diagnostics("a.rs", 100).await;
        assert!(second.is_empty());
    }

    #[test]
    fn error_diagnostics_filters_severity() {
        let diags = vec![
            Diagnostic::error("bad", 1),
            Diagnostic {
                severity: DiagnosticSeverity::Warning,
                message: "meh".into(),
                line: 2,
            },
        ];
        assert_eq!(error_diagnostics(&diags).len(), 1);
    }

    #[test]
    fn relative_path_strips_workspace_root() {
        let host = MockHost::new();
        assert_eq!(host.as_relative_path("/workspace/src/a.rs"), "src/a.rs");
        assert_eq!(host.as_relative_path("elsewhere/b.rs"), "elsewhere/b.rs");
    }

    #[tokio::test]
    async fn local_host_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());
        host.write_file("sub/f.txt", "content").await.unwrap();
        assert_eq!(host.read_file("sub/f.txt").await.unwrap(), "content");
        assert!(host.stat("sub/f.txt").await.unwrap().mtime_ms > 0);
    }
}
