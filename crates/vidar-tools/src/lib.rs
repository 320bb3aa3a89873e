// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod command;
pub mod registry;
pub mod tool;
pub mod toolset;

pub use command::{analyze_command, displayed_severity, requires_approval, Severity};
pub use registry::ToolRegistry;
pub use tool::{stable_args_json, Tool, ToolCall, ToolKind, ToolResult};
pub use toolset::{allowed_tools, filter_calls, is_allowed, READ_ONLY_TOOLS};
