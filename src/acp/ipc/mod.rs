// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control channel between CLI invocations and a running session.
//!
//! ```text
//! ┌──────────────────┐   prompt/permission/   ┌──────────────────┐
//! │ crew acp prompt  │──cancel/stop (NDJSON)─►│  Unix socket     │
//! │ (any process)    │◄─────── ack ───────────│  (session owner) │
//! └──────────────────┘                        └────────┬─────────┘
//!                                                      │ next()
//!                                                      ▼
//!                                               Command Router
//! ```
//!
//! Producers connect, write one command and wait for an acknowledgement.
//! The session pulls commands with a blocking, cancellable [`ControlChannel::next`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::types::AcpCommand;

pub use client::{send_command, IpcSender};
pub use error::{IpcError, IpcResult};
pub use protocol::Ack;
pub use server::SocketControlChannel;
pub use transport::socket_path;

/// Consumer side of a per-task command queue.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Wait for the next command, or fail with [`IpcError::Cancelled`] once
    /// `cancel` fires.
    async fn next(&self, cancel: &CancellationToken) -> Result<AcpCommand, IpcError>;
}

/// Opens the control channel for a run.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, namespace: &str, task_id: u64) -> Result<Arc<dyn ControlChannel>, IpcError>;
}

/// Opens socket channels under a state directory.
#[derive(Debug, Clone)]
pub struct SocketChannelFactory {
    ipc_dir: PathBuf,
}

impl SocketChannelFactory {
    pub fn new(ipc_dir: impl Into<PathBuf>) -> Self {
        Self { ipc_dir: ipc_dir.into() }
    }
}

#[async_trait]
impl ChannelFactory for SocketChannelFactory {
    async fn open(&self, namespace: &str, task_id: u64) -> Result<Arc<dyn ControlChannel>, IpcError> {
        let path = socket_path(&self.ipc_dir, namespace, task_id);
        Ok(Arc::new(SocketControlChannel::bind(path).await?))
    }
}

/// In-process control channel.
///
/// Cloning shares the same queue, so a test can keep a handle for sending
/// while the runtime reads from another.
#[derive(Clone)]
pub struct LocalControlChannel {
    tx: mpsc::Sender<AcpCommand>,
    rx: Arc<Mutex<mpsc::Receiver<AcpCommand>>>,
}

impl LocalControlChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(server::QUEUE_CAPACITY);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub async fn send(&self, cmd: AcpCommand) -> Result<(), IpcError> {
        self.tx.send(cmd).await.map_err(|_| IpcError::Closed)
    }
}

impl Default for LocalControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlChannel for LocalControlChannel {
    async fn next(&self, cancel: &CancellationToken) -> Result<AcpCommand, IpcError> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IpcError::Cancelled),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Cancelled),
            cmd = rx.recv() => cmd.ok_or(IpcError::Closed),
        }
    }
}

#[async_trait]
impl ChannelFactory for LocalControlChannel {
    async fn open(&self, _namespace: &str, _task_id: u64) -> Result<Arc<dyn ControlChannel>, IpcError> {
        Ok(Arc::new(self.clone()))
    }
}
