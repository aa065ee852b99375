// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent Client Protocol session runtime.
//!
//! Drives one coding agent per task: the agent runs as a subprocess speaking
//! ACP over stdio, inside a git worktree dedicated to the task. Other
//! processes steer the session through a per-task control channel.
//!
//! # Architecture
//!
//! ```text
//!   crew acp prompt ──► ControlChannel ──► Router ──┬─► prompts ──► Orchestrator ──► agent
//!                                                   ├─► permissions ──► ClientAdapter ◄── agent
//!                                                   ├─► cancels
//!                                                   └─► stop
//!
//!   ClientAdapter ──► EventLog (JSONL)      SubstateWriter ──► SubstateStore
//! ```
//!
//! - [`orchestrator`] - session lifecycle and main loop
//! - [`client`] - inbound agent requests (permissions, session updates)
//! - [`connection`] - agent subprocess and outbound protocol calls
//! - [`router`] - demultiplexes control commands into typed queues
//! - [`ipc`] - control channel transport
//! - [`event_log`] - append-only per-session event logs
//! - [`substate`] - persisted fine-grained execution state

pub mod client;
pub mod connection;
pub mod error;
pub mod event_log;
pub mod ipc;
pub mod orchestrator;
pub mod rollback;
pub mod router;
pub mod substate;
pub mod types;

pub use client::{output_sink, stdout_sink, ClientAdapter, OutputSink, SessionBinding};
pub use connection::{
    AcpConnection, AgentConnection, AgentLauncher, ConnectionError, LaunchSpec, LaunchedAgent, ProcessExit,
    ProcessLauncher,
};
pub use error::RuntimeError;
pub use event_log::{EventLog, EventLogFactory, JsonlEventLog, JsonlLogFactory, MemoryEventLog};
pub use ipc::{ChannelFactory, ControlChannel, IpcError, IpcSender, LocalControlChannel, SocketChannelFactory};
pub use orchestrator::{ExecuteRequest, Orchestrator, RuntimeDeps};
pub use substate::{MemorySubstateStore, SqliteSubstateStore, SubstateStore, SubstateWriter};
pub use types::{
    AcpCommand, AcpEvent, EventType, ExecutionSubstate, PermissionOption, PermissionOutcome, PermissionRequest,
    TurnEnd,
};
