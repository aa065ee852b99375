// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Inbound side of the agent protocol.
//!
//! The agent calls back into the runtime for permission decisions and to
//! stream session updates. Permission requests block until a decision
//! arrives from the control channel, the session is stopped, or the run is
//! cancelled. Filesystem and terminal requests are refused: the runtime is
//! headless and proxies neither.

use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

use agent_client_protocol as acp;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event_log::EventLog;
use super::substate::SubstateWriter;
use super::types::{
    AcpEvent, EventType, ExecutionSubstate, PermissionOption, PermissionOutcome, PermissionRequest,
};

/// Where streamed agent message text is written.
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wrap a writer as an output sink.
pub fn output_sink(writer: impl Write + Send + 'static) -> OutputSink {
    let boxed: Box<dyn Write + Send> = Box::new(writer);
    Arc::new(Mutex::new(boxed))
}

/// Output sink writing to the process's stdout.
pub fn stdout_sink() -> OutputSink {
    output_sink(std::io::stdout())
}

/// Everything the adapter needs once the session exists.
pub struct SessionBinding {
    pub session_id: String,
    pub event_log: Arc<dyn EventLog>,
    /// Option ids routed from `permission` commands.
    pub permissions: mpsc::Receiver<String>,
    /// Fires when a `stop` command arrives.
    pub stop: CancellationToken,
}

struct BoundSession {
    session_id: String,
    event_log: Arc<dyn EventLog>,
    permissions: tokio::sync::Mutex<mpsc::Receiver<String>>,
    stop: CancellationToken,
}

struct AdapterInner {
    substate: SubstateWriter,
    cancel: CancellationToken,
    output: OutputSink,
    bound: OnceLock<BoundSession>,
    /// Updates that arrived before the session id was known.
    pending: Mutex<Vec<Value>>,
}

/// Protocol client handed to the agent connection.
///
/// Cheap to clone; all clones share the same session binding.
#[derive(Clone)]
pub struct ClientAdapter {
    inner: Arc<AdapterInner>,
}

impl ClientAdapter {
    pub fn new(substate: SubstateWriter, cancel: CancellationToken, output: OutputSink) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                substate,
                cancel,
                output,
                bound: OnceLock::new(),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach the session. Updates received before this point are logged now.
    pub async fn bind(&self, binding: SessionBinding) {
        let bound = BoundSession {
            session_id: binding.session_id,
            event_log: binding.event_log,
            permissions: tokio::sync::Mutex::new(binding.permissions),
            stop: binding.stop,
        };
        if self.inner.bound.set(bound).is_err() {
            warn!("Client adapter bound twice; keeping the first session");
            return;
        }

        let pending = self
            .inner
            .pending
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default();
        for update in pending {
            self.persist_update(update).await;
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.inner.bound.get().map(|b| b.session_id.as_str())
    }

    /// Append an event to the session log. Failures are logged, not returned.
    pub async fn log_event(&self, event_type: EventType, payload: Value) {
        let Some(bound) = self.inner.bound.get() else {
            debug!(event = %event_type, "Dropping event for unbound session");
            return;
        };
        let event = AcpEvent::new(event_type, &bound.session_id, payload);
        if let Err(e) = bound.event_log.write(&event).await {
            warn!(session_id = %bound.session_id, event = %event_type, "Failed to write event: {}", e);
        }
    }

    async fn set_substate(&self, state: ExecutionSubstate) {
        if let Err(e) = self.inner.substate.set(state).await {
            warn!("Failed to persist substate {}: {}", state, e);
        }
    }

    /// Wait for a decision on a permission request.
    ///
    /// Decisions naming an option that was not offered are ignored. A stop
    /// command or cancellation of the run answers `Cancelled`.
    pub async fn request_permission(&self, request: PermissionRequest) -> PermissionOutcome {
        let Some(bound) = self.inner.bound.get() else {
            warn!("Permission requested before the session was ready; cancelling");
            return PermissionOutcome::Cancelled;
        };

        self.set_substate(ExecutionSubstate::AwaitingPermission).await;
        self.log_event(EventType::PermissionRequest, request.payload.clone())
            .await;
        info!(
            session_id = %bound.session_id,
            options = ?request.options.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            "Agent is waiting for a permission decision"
        );

        let mut permissions = bound.permissions.lock().await;
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break "cancelled",
                _ = bound.stop.cancelled() => break "stopped",
                decision = permissions.recv() => match decision {
                    Some(option_id) if request.offers(&option_id) => {
                        self.set_substate(ExecutionSubstate::Running).await;
                        self.log_event(EventType::PermissionSelected, json!({ "option_id": option_id }))
                            .await;
                        return PermissionOutcome::Selected(option_id);
                    }
                    Some(option_id) => {
                        warn!(option_id = %option_id, "Ignoring decision for an option that was not offered");
                    }
                    None => break "control channel closed",
                },
            }
        };

        self.set_substate(ExecutionSubstate::Idle).await;
        self.log_event(EventType::PermissionCancelled, json!({ "reason": reason }))
            .await;
        PermissionOutcome::Cancelled
    }

    /// Classify and persist a streamed session update.
    ///
    /// `update` is the protocol's update object, tagged by `sessionUpdate`.
    /// Agent message text is also echoed to the output sink as it arrives.
    pub async fn record_update(&self, update: Value) {
        let event_type = classify_update(&update);
        if event_type == EventType::AgentMessageChunk {
            if let Some(text) = update.pointer("/content/text").and_then(Value::as_str) {
                self.write_output(text);
            }
        }

        if self.inner.bound.get().is_none() {
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.push(update);
            }
            return;
        }
        self.persist_update(update).await;
    }

    async fn persist_update(&self, update: Value) {
        let event_type = classify_update(&update);
        self.log_event(event_type, update).await;
    }

    fn write_output(&self, text: &str) {
        match self.inner.output.lock() {
            Ok(mut out) => {
                if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
                    debug!("Failed to write agent output: {}", e);
                }
            }
            Err(_) => debug!("Output sink mutex poisoned"),
        }
    }
}

fn classify_update(update: &Value) -> EventType {
    update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .map(EventType::classify)
        .unwrap_or(EventType::SessionUpdate)
}

#[async_trait::async_trait(?Send)]
impl acp::Client for ClientAdapter {
    async fn request_permission(
        &self,
        args: acp::RequestPermissionRequest,
    ) -> acp::Result<acp::RequestPermissionResponse> {
        let options = args
            .options
            .iter()
            .map(|opt| PermissionOption::new(opt.option_id.to_string(), opt.name.clone()))
            .collect();
        let payload = serde_json::to_value(&args).unwrap_or(Value::Null);

        let outcome = ClientAdapter::request_permission(self, PermissionRequest { options, payload }).await;
        let selected = match outcome {
            PermissionOutcome::Selected(id) => args.options.iter().find(|opt| opt.option_id.to_string() == id),
            PermissionOutcome::Cancelled => None,
        };

        Ok(acp::RequestPermissionResponse::new(match selected {
            Some(opt) => acp::RequestPermissionOutcome::Selected(acp::SelectedPermissionOutcome::new(
                opt.option_id.clone(),
            )),
            None => acp::RequestPermissionOutcome::Cancelled,
        }))
    }

    async fn session_notification(&self, args: acp::SessionNotification) -> acp::Result<()> {
        let update = serde_json::to_value(&args.update).map_err(|e| {
            warn!("Failed to serialize session update: {}", e);
            acp::Error::internal_error()
        })?;
        self.record_update(update).await;
        Ok(())
    }

    async fn write_text_file(&self, _args: acp::WriteTextFileRequest) -> acp::Result<acp::WriteTextFileResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn read_text_file(&self, _args: acp::ReadTextFileRequest) -> acp::Result<acp::ReadTextFileResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn create_terminal(&self, _args: acp::CreateTerminalRequest) -> acp::Result<acp::CreateTerminalResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn terminal_output(&self, _args: acp::TerminalOutputRequest) -> acp::Result<acp::TerminalOutputResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn release_terminal(
        &self,
        _args: acp::ReleaseTerminalRequest,
    ) -> acp::Result<acp::ReleaseTerminalResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn wait_for_terminal_exit(
        &self,
        _args: acp::WaitForTerminalExitRequest,
    ) -> acp::Result<acp::WaitForTerminalExitResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn kill_terminal_command(
        &self,
        _args: acp::KillTerminalCommandRequest,
    ) -> acp::Result<acp::KillTerminalCommandResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn ext_method(&self, _args: acp::ExtRequest) -> acp::Result<acp::ExtResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn ext_notification(&self, _args: acp::ExtNotification) -> acp::Result<()> {
        Ok(())
    }
}
