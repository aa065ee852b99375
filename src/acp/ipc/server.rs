// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Listening side of the control channel.
//!
//! The running session binds one socket per task. Each producer connection
//! delivers a single command, which is queued in arrival order and
//! acknowledged once it is queued.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::types::AcpCommand;

use super::error::IpcError;
use super::protocol::{decode, encode, Ack};
use super::transport;
use super::ControlChannel;

/// Capacity of the queue between the accept loop and the reader.
pub const QUEUE_CAPACITY: usize = 100;

/// Control channel served over a Unix domain socket.
pub struct SocketControlChannel {
    socket_path: PathBuf,
    rx: Mutex<mpsc::Receiver<AcpCommand>>,
    accept_task: JoinHandle<()>,
}

impl SocketControlChannel {
    /// Bind the socket and start accepting producers.
    ///
    /// Fails with [`IpcError::AlreadyListening`] if another live session owns
    /// the socket.
    pub async fn bind(socket_path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if transport::is_live(&socket_path).await {
            return Err(IpcError::AlreadyListening(socket_path));
        }

        let listener = transport::bind(&socket_path)
            .await
            .map_err(|e| IpcError::BindFailed(format!("{}: {}", socket_path.display(), e)))?;
        info!("Control channel listening on {}", socket_path.display());

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let accept_task = tokio::spawn(accept_loop(listener, tx));

        Ok(Self {
            socket_path,
            rx: Mutex::new(rx),
            accept_task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<AcpCommand>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, tx).await {
                        warn!("Control connection failed: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept control connection: {}", e);
                break;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, tx: mpsc::Sender<AcpCommand>) -> Result<(), IpcError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| IpcError::from_io_error("reading command", e))?;

    let ack = match decode::<AcpCommand>(&line) {
        Ok(cmd) => {
            debug!(kind = cmd.kind(), "Control command received");
            match tx.send(cmd).await {
                Ok(()) => Ack::ok(),
                Err(_) => Ack::error("session is shutting down"),
            }
        }
        Err(e) => Ack::error(format!("invalid command: {}", e)),
    };

    let encoded = encode(&ack).map_err(|e| IpcError::InvalidMessage(e.to_string()))?;
    write_half
        .write_all(encoded.as_bytes())
        .await
        .map_err(|e| IpcError::from_io_error("writing ack", e))?;
    write_half
        .flush()
        .await
        .map_err(|e| IpcError::from_io_error("flushing ack", e))?;
    Ok(())
}

#[async_trait]
impl ControlChannel for SocketControlChannel {
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

impl Drop for SocketControlChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
        transport::cleanup(&self.socket_path);
    }
}
