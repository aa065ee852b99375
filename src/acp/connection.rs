// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent subprocess and protocol connection.
//!
//! The protocol connection is `!Send`: it and its I/O future must run on a
//! `tokio::task::LocalSet`. The subprocess waiter is an ordinary task that
//! kills the child when the run's cancellation token fires.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::rc::Rc;

use agent_client_protocol as acp;
use acp::Agent as _;
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientAdapter;
use super::types::TurnEnd;

/// Errors from the agent connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Outbound calls the runtime makes on the agent.
#[async_trait(?Send)]
pub trait AgentConnection {
    async fn initialize(&self) -> Result<(), ConnectionError>;

    /// Open a session rooted at `cwd` and return its id.
    async fn new_session(&self, cwd: &Path) -> Result<String, ConnectionError>;

    /// Run one prompt turn to completion.
    async fn prompt(&self, session_id: &str, text: &str) -> Result<TurnEnd, ConnectionError>;

    /// Ask the agent to abandon the current turn.
    async fn cancel(&self, session_id: &str) -> Result<(), ConnectionError>;
}

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    pub description: String,
}

impl ProcessExit {
    pub fn success() -> Self {
        Self {
            success: true,
            description: "exit status: 0".to_string(),
        }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            success: false,
            description: description.into(),
        }
    }
}

impl From<std::io::Result<ExitStatus>> for ProcessExit {
    fn from(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => ProcessExit::success(),
            Ok(status) => ProcessExit::failure(status.to_string()),
            Err(e) => ProcessExit::failure(format!("failed to wait for agent: {}", e)),
        }
    }
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Rendered shell command line.
    pub command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Cancelling this token kills the agent.
    pub cancel: CancellationToken,
}

/// A running agent.
pub struct LaunchedAgent {
    pub connection: Rc<dyn AgentConnection>,
    /// Resolves once the process has exited.
    pub exited: oneshot::Receiver<ProcessExit>,
    /// Resolves once the protocol stream closes, with the I/O error if any.
    pub closed: oneshot::Receiver<Option<String>>,
}

/// Starts agents. Must be called from within a `LocalSet`.
#[async_trait(?Send)]
pub trait AgentLauncher {
    async fn launch(&self, spec: LaunchSpec, client: ClientAdapter) -> Result<LaunchedAgent, ConnectionError>;
}

/// Launches agents as `sh -c <command>` subprocesses speaking ACP on stdio.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec, client: ClientAdapter) -> Result<LaunchedAgent, ConnectionError> {
        info!(command = %spec.command, cwd = %spec.cwd.display(), "Spawning agent");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectionError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectionError::Spawn("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::Spawn("agent stdout unavailable".to_string()))?;

        let (conn, handle_io) = acp::ClientSideConnection::new(client, stdin.compat_write(), stdout.compat(), |fut| {
            tokio::task::spawn_local(fut);
        });

        let (closed_tx, closed) = oneshot::channel();
        tokio::task::spawn_local(async move {
            let error = handle_io.await.err().map(|e| e.to_string());
            debug!(error = ?error, "Agent protocol stream closed");
            let _ = closed_tx.send(error);
        });

        let (exit_tx, exited) = oneshot::channel();
        let cancel = spec.cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill agent: {}", e);
                    }
                    child.wait().await
                }
            };
            let exit = ProcessExit::from(status);
            debug!(success = exit.success, status = %exit.description, "Agent exited");
            let _ = exit_tx.send(exit);
        });

        Ok(LaunchedAgent {
            connection: Rc::new(AcpConnection { conn }),
            exited,
            closed,
        })
    }
}

/// [`AgentConnection`] over an ACP client-side connection.
pub struct AcpConnection {
    conn: acp::ClientSideConnection,
}

#[async_trait(?Send)]
impl AgentConnection for AcpConnection {
    async fn initialize(&self) -> Result<(), ConnectionError> {
        self.conn
            .initialize(
                acp::InitializeRequest::new(acp::ProtocolVersion::V1)
                    .client_capabilities(acp::ClientCapabilities::default())
                    .client_info(acp::Implementation::new("crew", env!("CARGO_PKG_VERSION"))),
            )
            .await
            .map_err(|e| ConnectionError::Protocol(format!("initialize: {}", e)))?;
        debug!("ACP connection initialized");
        Ok(())
    }

    async fn new_session(&self, cwd: &Path) -> Result<String, ConnectionError> {
        let response = self
            .conn
            .new_session(acp::NewSessionRequest::new(cwd.to_path_buf()))
            .await
            .map_err(|e| ConnectionError::Protocol(format!("new session: {}", e)))?;
        Ok(response.session_id.to_string())
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<TurnEnd, ConnectionError> {
        let response = self
            .conn
            .prompt(acp::PromptRequest::new(
                acp::SessionId::new(session_id.to_string()),
                vec![acp::ContentBlock::Text(acp::TextContent::new(text.to_string()))],
            ))
            .await
            .map_err(|e| ConnectionError::Protocol(format!("prompt: {}", e)))?;

        Ok(turn_end_from(&response.stop_reason))
    }

    async fn cancel(&self, session_id: &str) -> Result<(), ConnectionError> {
        self.conn
            .cancel(acp::CancelNotification::new(acp::SessionId::new(session_id.to_string())))
            .await
            .map_err(|e| ConnectionError::Protocol(format!("cancel: {}", e)))
    }
}

/// Map the protocol's stop reason through its wire name.
fn turn_end_from(reason: &acp::StopReason) -> TurnEnd {
    serde_json::to_value(reason)
        .ok()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_else(|| {
            warn!(?reason, "Unknown stop reason; treating as end of turn");
            TurnEnd::EndTurn
        })
}
