// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session runtime errors.

use thiserror::Error;

use crate::error::{ConfigError, StoreError};

use super::ipc::IpcError;

/// Errors returned by [`super::Orchestrator::execute`].
///
/// Grouped by when they can happen: preconditions mutate nothing, setup
/// failures roll the worktree back, handshake failures leave the task as it
/// was, post-handshake failures restore the task, and run-time failures mark
/// the task as errored.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Task {task_id} is not startable (status: {status})")]
    TaskNotStartable { task_id: u64, status: String },

    #[error("Task {task_id} is blocked: {reason}")]
    TaskBlocked { task_id: u64, reason: String },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent is disabled: {0}")]
    AgentDisabled(String),

    #[error("No agent given and no default agent configured")]
    NoAgentConfigured,

    #[error("Agent {0} rendered an empty command")]
    EmptyCommand(String),

    #[error("Failed to load task: {0}")]
    Task(#[source] StoreError),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to open control channel: {0}")]
    Channel(#[source] IpcError),

    #[error("Worktree setup failed: {0}")]
    Setup(String),

    #[error("Agent handshake failed: {0}")]
    Handshake(String),

    #[error("Failed to record session start: {0}")]
    PostHandshake(String),

    #[error("Control channel failed: {0}")]
    Router(#[source] IpcError),

    #[error("Agent exited abnormally: {0}")]
    AgentExited(String),

    #[error("Run cancelled")]
    Cancelled,

    /// A failure whose recovery step failed as well.
    #[error("{primary} (recovery also failed: {recovery})")]
    Compound {
        primary: Box<RuntimeError>,
        recovery: String,
    },
}

impl RuntimeError {
    /// Attach a failed recovery step to this error.
    pub fn with_recovery_failure(self, recovery: impl Into<String>) -> Self {
        RuntimeError::Compound {
            primary: Box::new(self),
            recovery: recovery.into(),
        }
    }

    /// Precondition failures are raised before anything is touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RuntimeError::TaskNotStartable { .. }
                | RuntimeError::TaskBlocked { .. }
                | RuntimeError::AgentNotFound(_)
                | RuntimeError::AgentDisabled(_)
                | RuntimeError::NoAgentConfigured
                | RuntimeError::EmptyCommand(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }
}
