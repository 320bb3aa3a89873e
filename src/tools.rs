// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minimal local tool set for headless runs.
//!
//! The editor host normally provides the real tool suite (LSP queries,
//! diagnostics, workspace search); the CLI ships just enough to be useful
//! on a plain filesystem.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use vidar_core::HostEnvironment;
use vidar_tools::{Tool, ToolCall, ToolKind, ToolRegistry, ToolResult};

pub fn build_registry(host: Arc<dyn HostEnvironment>, command_timeout_secs: u64) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool { host: host.clone() });
    registry.register(WriteFileTool { host: host.clone() });
    registry.register(ListDirTool { host });
    registry.register(TerminalTool {
        timeout: Duration::from_secs(command_timeout_secs),
    });
    registry
}

struct ReadFileTool {
    host: Arc<dyn HostEnvironment>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a file from the workspace. Args: path."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadFile
    }
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(path) = call.str_arg("path") else {
            return ToolResult::err("read_file requires a 'path' argument");
        };
        match self.host.read_file(path).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::err(format!("cannot read {path}: {e}")),
        }
    }
}

struct WriteFileTool {
    host: Arc<dyn HostEnvironment>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Create or overwrite a file. Args: path, content."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }
    fn kind(&self) -> ToolKind {
        ToolKind::FileEdit
    }
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(path) = call.str_arg("path") else {
            return ToolResult::err("write_file requires a 'path' argument");
        };
        let content = call.str_arg("content").unwrap_or_default();
        match self.host.write_file(path, content).await {
            Ok(()) => ToolResult::ok(format!("Wrote {path} ({} bytes)", content.len())),
            Err(e) => ToolResult::err(format!("cannot write {path}: {e}")),
        }
    }
}

struct ListDirTool {
    host: Arc<dyn HostEnvironment>,
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "List a directory relative to the workspace root. Args: path (optional)."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } }
        })
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let rel = call.str_arg("path").unwrap_or(".");
        let full = self.host.workspace_root().join(rel);
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(e) => e,
            Err(e) => return ToolResult::err(format!("cannot list {rel}: {e}")),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        ToolResult::ok(names.join("\n"))
    }
}

struct TerminalTool {
    timeout: Duration,
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "terminal"
    }
    fn description(&self) -> &str {
        "Run a shell command in the workspace. Args: command."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"]
        })
    }
    fn kind(&self) -> ToolKind {
        ToolKind::Terminal
    }
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(command) = call.str_arg("command") else {
            return ToolResult::err("terminal requires a 'command' argument");
        };
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("cannot spawn: {e}")),
        };
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return ToolResult::err(format!("command failed: {e}")),
            Err(_) => {
                return ToolResult::err(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            text.push_str(&format!(
                "\n[exit code: {}]",
                output.status.code().unwrap_or(-1)
            ));
        }
        ToolResult::ok(text)
    }
}
