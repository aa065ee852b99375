// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control channel error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur on the control channel.
#[derive(Debug, Error)]
pub enum IpcError {
    /// No runtime is listening for the task.
    #[error("No running session for this task (socket {0})")]
    NotRunning(PathBuf),

    /// Another runtime already owns the socket.
    #[error("A session is already listening on {0}")]
    AlreadyListening(PathBuf),

    #[error("Failed to bind control socket: {0}")]
    BindFailed(String),

    #[error("Invalid control message: {0}")]
    InvalidMessage(String),

    /// The runtime received the command but refused it.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// The waiting side was cancelled.
    #[error("Control channel read cancelled")]
    Cancelled,

    #[error("Control channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl IpcError {
    /// Create an IPC error from an IO error with context.
    pub fn from_io_error(context: &str, err: io::Error) -> Self {
        IpcError::Transport(format!("{}: {}", context, err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IpcError::Cancelled)
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
