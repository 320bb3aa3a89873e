// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vidar_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "vidar",
    about = "A local-LLM coding agent for Ollama-compatible servers",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Explicit config file (merged over the standard search paths).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG controls the filter).
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one agent task to completion and print the result.
    Run {
        /// The task to perform.
        task: String,
        /// Executor mode.
        #[arg(long, value_enum)]
        mode: Option<AgentMode>,
        /// Model name override.
        #[arg(long)]
        model: Option<String>,
        /// Workspace root (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Auto-approve commands and sensitive edits (critical commands
        /// still prompt).
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Print the merged configuration.
    ShowConfig,
    /// List models available on the server.
    ListModels,
}
