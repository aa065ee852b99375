// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command router.
//!
//! Reads the control channel in a loop and sorts each command into its own
//! queue, so the session loop can wait on prompts, cancels and stop
//! independently while permission decisions go to the client adapter.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ipc::{ControlChannel, IpcError};
use super::types::AcpCommand;

/// Capacity of each control queue.
pub const QUEUE_CAPACITY: usize = 10;

/// Receiving ends of the router's queues.
pub struct RouterQueues {
    pub prompts: mpsc::Receiver<String>,
    pub permissions: mpsc::Receiver<String>,
    pub cancels: mpsc::Receiver<()>,
    /// Cancelled exactly once, when a stop command arrives.
    pub stop: CancellationToken,
    /// Carries at most one read error; closes when the router ends.
    pub errors: mpsc::Receiver<IpcError>,
}

/// Spawn the router task.
///
/// The router ends on `stop`, on the first read error, or silently when
/// `cancel` fires.
pub fn spawn_router(channel: Arc<dyn ControlChannel>, cancel: CancellationToken) -> (JoinHandle<()>, RouterQueues) {
    let (prompt_tx, prompts) = mpsc::channel(QUEUE_CAPACITY);
    let (permission_tx, permissions) = mpsc::channel(QUEUE_CAPACITY);
    let (cancel_tx, cancels) = mpsc::channel(QUEUE_CAPACITY);
    let (error_tx, errors) = mpsc::channel(1);
    let stop = CancellationToken::new();

    let router_stop = stop.clone();
    let handle = tokio::spawn(async move {
        loop {
            let cmd = match channel.next(&cancel).await {
                Ok(cmd) => cmd,
                Err(IpcError::Cancelled) => {
                    debug!("Router cancelled");
                    break;
                }
                Err(e) => {
                    warn!("Control channel read failed: {}", e);
                    let _ = error_tx.send(e).await;
                    break;
                }
            };

            debug!(kind = cmd.kind(), "Routing command");
            // A send only fails when the consumer is gone, which means the
            // session is already ending; the command is dropped.
            let delivered = match cmd {
                AcpCommand::Prompt { text } => forward(&prompt_tx, text, &cancel).await,
                AcpCommand::Permission { option_id } => forward(&permission_tx, option_id, &cancel).await,
                AcpCommand::Cancel => forward(&cancel_tx, (), &cancel).await,
                AcpCommand::Stop => {
                    router_stop.cancel();
                    break;
                }
            };
            if !delivered {
                debug!("Router consumer gone");
            }
        }
    });

    (
        handle,
        RouterQueues {
            prompts,
            permissions,
            cancels,
            stop,
            errors,
        },
    )
}

async fn forward<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::ipc::LocalControlChannel;
    use async_trait::async_trait;

    struct FailingChannel;

    #[async_trait]
    impl ControlChannel for FailingChannel {
        async fn next(&self, _cancel: &CancellationToken) -> Result<AcpCommand, IpcError> {
            Err(IpcError::Transport("socket vanished".to_string()))
        }
    }

    #[tokio::test]
    async fn test_routes_each_kind_and_stops_last() {
        let channel = LocalControlChannel::new();
        channel.send(AcpCommand::prompt("hello")).await.unwrap();
        channel.send(AcpCommand::Cancel).await.unwrap();
        channel.send(AcpCommand::permission("X")).await.unwrap();
        channel.send(AcpCommand::Stop).await.unwrap();
        channel.send(AcpCommand::prompt("after stop")).await.unwrap();

        let (handle, mut queues) = spawn_router(Arc::new(channel), CancellationToken::new());
        handle.await.unwrap();

        assert!(queues.stop.is_cancelled());
        assert_eq!(queues.prompts.recv().await.as_deref(), Some("hello"));
        assert_eq!(queues.cancels.recv().await, Some(()));
        assert_eq!(queues.permissions.recv().await.as_deref(), Some("X"));
        // The router ended at stop: nothing after it was routed.
        assert_eq!(queues.prompts.recv().await, None);
        assert!(queues.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_double_stop_ends_once() {
        let channel = LocalControlChannel::new();
        let (a, b) = (channel.clone(), channel.clone());
        let senders = tokio::join!(a.send(AcpCommand::Stop), b.send(AcpCommand::Stop));
        senders.0.unwrap();
        senders.1.unwrap();

        let (handle, queues) = spawn_router(Arc::new(channel.clone()), CancellationToken::new());
        handle.await.unwrap();
        assert!(queues.stop.is_cancelled());

        // Second stop is still queued, untouched.
        let next = channel.next(&CancellationToken::new()).await.unwrap();
        assert_eq!(next, AcpCommand::Stop);
    }

    #[tokio::test]
    async fn test_read_error_is_reported_once() {
        let (handle, mut queues) = spawn_router(Arc::new(FailingChannel), CancellationToken::new());
        handle.await.unwrap();

        let err = queues.errors.recv().await.unwrap();
        assert!(err.to_string().contains("socket vanished"));
        assert!(queues.errors.recv().await.is_none());
        assert!(!queues.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_is_silent() {
        let cancel = CancellationToken::new();
        let (handle, mut queues) = spawn_router(Arc::new(LocalControlChannel::new()), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        assert!(queues.errors.recv().await.is_none());
        assert!(!queues.stop.is_cancelled());
    }
}
