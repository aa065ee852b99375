// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Producer side of the control channel, used by short-lived CLI commands.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::acp::types::AcpCommand;

use super::error::IpcError;
use super::protocol::{decode, encode, Ack};
use super::transport;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Deliver one command to the session listening on `socket_path`.
pub async fn send_command(socket_path: &Path, cmd: &AcpCommand) -> Result<(), IpcError> {
    let stream = transport::connect(socket_path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            IpcError::NotRunning(socket_path.to_path_buf())
        }
        _ => IpcError::from_io_error("connecting to control socket", e),
    })?;

    let (read_half, mut write_half) = stream.into_split();
    let encoded = encode(cmd).map_err(|e| IpcError::InvalidMessage(e.to_string()))?;
    write_half
        .write_all(encoded.as_bytes())
        .await
        .map_err(|e| IpcError::from_io_error("writing command", e))?;
    write_half
        .flush()
        .await
        .map_err(|e| IpcError::from_io_error("flushing command", e))?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let read = tokio::time::timeout(ACK_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| IpcError::Transport("timed out waiting for ack".to_string()))?
        .map_err(|e| IpcError::from_io_error("reading ack", e))?;
    if read == 0 {
        return Err(IpcError::Closed);
    }

    let ack: Ack = decode(&line).map_err(|e| IpcError::InvalidMessage(e.to_string()))?;
    if ack.ok {
        debug!(kind = cmd.kind(), "Control command acknowledged");
        Ok(())
    } else {
        Err(IpcError::Rejected(ack.error.unwrap_or_default()))
    }
}

/// Sends commands to sessions by (namespace, task).
#[derive(Debug, Clone)]
pub struct IpcSender {
    ipc_dir: PathBuf,
}

impl IpcSender {
    pub fn new(ipc_dir: impl Into<PathBuf>) -> Self {
        Self { ipc_dir: ipc_dir.into() }
    }

    pub fn socket_path(&self, namespace: &str, task_id: u64) -> PathBuf {
        transport::socket_path(&self.ipc_dir, namespace, task_id)
    }

    pub async fn send(&self, namespace: &str, task_id: u64, cmd: &AcpCommand) -> Result<(), IpcError> {
        send_command(&self.socket_path(namespace, task_id), cmd).await
    }
}
