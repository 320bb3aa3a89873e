// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod approval;
mod budget;
mod checkpoint;
mod compact;
mod control;
mod dispatch;
mod events;
mod explore;
mod history;
mod host;
mod memory;
mod prompts;
mod recover;
mod session;
mod store;
mod stream;
mod summary;
mod textcalls;

pub use agent::{AgentDeps, AgentLoop, LoopConfig, LoopOutcome};
pub use approval::{ApprovalGate, ApprovalKind, ApprovalRequest, ApprovalResponse};
pub use budget::ContextBudgeter;
pub use checkpoint::CheckpointManager;
pub use compact::{compact_history, emergency_compact, smart_truncate, CompactionReport};
pub use control::{ControlPacket, ControlState};
pub use dispatch::{DispatchOutcome, ExecutedCall, SubAgentRunner, ToolDispatcher};
pub use events::{ActionStatus, ChannelSink, EventBus, NullSink, UiEvent, UiSink};
pub use explore::{make_subagent_runner, run_explore, ExploreRequest};
pub use history::ConversationHistory;
pub use host::{Diagnostic, DiagnosticSeverity, FileStat, HostEnvironment, LocalHost, MockHost};
pub use memory::{IterationSummary, SessionMemory};
pub use recover::recover_tool_call;
pub use session::{Session, SessionStatus};
pub use store::{
    AddMessage, FileSnapshot, MemoryStore, MessageRecord, SessionPatch, SessionRecord,
    SessionStore, SnapshotAction, UI_EVENT_MARKER,
};
pub use stream::{StreamDecoder, StreamResult};
pub use summary::{build_final_summary, generate_title, SummaryInput};
