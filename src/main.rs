// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod tools;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use vidar_config::{AgentMode, SessionOptions};
use vidar_core::{
    make_subagent_runner, AgentDeps, AgentLoop, ApprovalGate, ChannelSink, LocalHost, LoopConfig,
    MemoryStore, Session, SessionPatch, SessionStatus, SessionStore, UiEvent,
};
use vidar_model::{ChatBackend, OllamaBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(vidar_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&*config).unwrap_or_default());
            Ok(())
        }
        Commands::ListModels => {
            let backend = OllamaBackend::new(config.model.base_url.clone());
            let models = backend
                .list_models()
                .await
                .context("listing models from the server")?;
            for m in models {
                println!("{}", m.name);
            }
            Ok(())
        }
        Commands::Run {
            task,
            mode,
            model,
            workspace,
            yes,
        } => run_task(config, task, mode, model, workspace, yes).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_task(
    config: Arc<vidar_config::Config>,
    task: String,
    mode: Option<AgentMode>,
    model: Option<String>,
    workspace: Option<std::path::PathBuf>,
    yes: bool,
) -> anyhow::Result<()> {
    let mode = mode.unwrap_or(config.agent.default_mode);
    let model = model.unwrap_or_else(|| config.model.name.clone());
    let workspace = match workspace {
        Some(w) => w,
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let backend = Arc::new(OllamaBackend::new(config.model.base_url.clone()));
    let store = Arc::new(MemoryStore::new());
    let host = Arc::new(LocalHost::new(&workspace));
    let registry = Arc::new(tools::build_registry(
        host.clone(),
        config.agent.tool_timeout_secs,
    ));
    let gate = Arc::new(ApprovalGate::new());
    let (sink, mut rx) = ChannelSink::new();

    let deps = AgentDeps {
        backend,
        registry,
        host,
        store: store.clone(),
        sink: Arc::new(sink),
        gate: gate.clone(),
        config: config.clone(),
    };

    let mut options = SessionOptions::from(&config.approvals);
    if yes {
        options.auto_approve_commands = true;
        options.auto_approve_sensitive_edits = true;
    }
    let session_id = store.create_session(&task, &model, &workspace).await?;
    let mut session = Session::new(task.clone(), mode, model.clone(), workspace.clone(), options);
    session.id = session_id.clone();

    let runner = mode.allows_subagents().then(|| {
        make_subagent_runner(deps.clone(), workspace.clone(), session.id.clone())
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("\ninterrupted — cancelling");
            cancel.cancel();
        });
    }

    let cfg = LoopConfig::orchestrator(mode, &config);
    let mut agent = AgentLoop::new(session, deps, cfg, runner);

    // Drive the loop while rendering events and answering approvals.
    let fut = agent.run(cancel.clone());
    tokio::pin!(fut);
    let outcome = loop {
        tokio::select! {
            res = &mut fut => break res?,
            ev = rx.recv() => {
                if let Some(ev) = ev {
                    render_event(&gate, &ev).await;
                }
            }
        }
    };
    while let Ok(ev) = rx.try_recv() {
        render_event(&gate, &ev).await;
    }

    println!();
    if !outcome.final_text.is_empty() {
        println!("{}", outcome.final_text);
    }

    if outcome.status == SessionStatus::Completed {
        // Label the stored session; races a 15 s timeout and is best-effort.
        let title_backend = OllamaBackend::new(config.model.base_url.clone());
        if let Some(title) = vidar_core::generate_title(&title_backend, &model, &task).await {
            let _ = store
                .update_session(
                    &session_id,
                    SessionPatch {
                        title: Some(title),
                        ..Default::default()
                    },
                )
                .await;
        }
    }

    match outcome.status {
        SessionStatus::Completed => Ok(()),
        SessionStatus::Cancelled => {
            eprintln!("cancelled after {} iteration(s)", outcome.iterations);
            std::process::exit(130);
        }
        other => anyhow::bail!("agent finished with status {other}"),
    }
}

async fn render_event(gate: &ApprovalGate, event: &UiEvent) {
    match event {
        UiEvent::StreamChunk { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        UiEvent::StreamThinking { .. } | UiEvent::ShowThinking | UiEvent::HideThinking => {}
        UiEvent::CollapseThinking { elapsed_ms } => {
            eprintln!("  [thought for {:.1}s]", *elapsed_ms as f64 / 1000.0);
        }
        UiEvent::ShowToolAction {
            tool,
            title,
            status,
            ..
        } => {
            eprintln!("  [{status:?}] {tool}: {title}");
        }
        UiEvent::StartProgressGroup { title } => eprintln!("  ── {title} ──"),
        UiEvent::FinishProgressGroup => eprintln!("  ──────────"),
        UiEvent::IterationBoundary {
            iteration,
            max_iterations,
        } => {
            eprintln!("── iteration {iteration}/{max_iterations} ──");
        }
        UiEvent::RequestToolApproval { approval } => {
            eprintln!(
                "approval required [{}]: {}",
                approval.severity,
                serde_json::to_string(&approval.payload).unwrap_or_default()
            );
            eprint!("allow? [y/N] ");
            let approved = read_line_blocking()
                .await
                .map(|line| matches!(line.trim(), "y" | "Y" | "yes"))
                .unwrap_or(false);
            gate.handle_response(&approval.id, approved, None);
        }
        UiEvent::ToolApprovalResult { approved, .. } => {
            eprintln!("  → {}", if *approved { "approved" } else { "denied" });
        }
        UiEvent::FilesChanged { files } => {
            eprintln!("files changed: {}", files.join(", "));
        }
        UiEvent::FinalMessage { text } => {
            println!("\n{text}");
        }
        UiEvent::ThinkingBlock { .. } | UiEvent::SubagentThinking { .. } => {}
        UiEvent::TokenUsage {
            prompt,
            completion,
            window,
        } => {
            eprintln!("  tokens: {prompt} prompt / {completion} completion (window {window})");
        }
        UiEvent::ShowError { message } => eprintln!("error: {message}"),
        UiEvent::ShowWarningBanner { message } => eprintln!("warning: {message}"),
    }
}

async fn read_line_blocking() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok()?;
        Some(line)
    })
    .await
    .ok()
    .flatten()
}
