// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session orchestrator: owns one agent run from start to finish.
//!
//! # Lifecycle
//!
//! ```text
//! validate task ──► resolve agent ──► open control channel
//!      │
//!      ▼
//! ensure worktree (create + hooks, rolled back on failure)
//!      │
//!      ▼
//! render command ──► spawn agent ──► initialize / new_session
//!      │
//!      ▼
//! substate running, task in progress ──► router + adapter bound
//!      │
//!      ▼
//! main loop until stop / exit / error / cancellation ──► substate idle
//! ```
//!
//! The main loop is the only place that talks to the agent connection.
//! Prompt turns run as local tasks and report back through a queue so that
//! cancel and stop stay deliverable while a turn is in flight.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{render, render_command, AgentDefinition, ConfigSource, CrewConfig, TemplateVars};
use crate::task::{Task, TaskRepository};
use crate::worktree::{run_script, WorktreeManager};

use super::client::{ClientAdapter, OutputSink, SessionBinding};
use super::connection::{AgentConnection, AgentLauncher, ConnectionError, LaunchSpec, ProcessExit};
use super::error::RuntimeError;
use super::event_log::EventLogFactory;
use super::ipc::{ChannelFactory, IpcError};
use super::router::{spawn_router, QUEUE_CAPACITY};
use super::rollback::Compensations;
use super::substate::{SubstateStore, SubstateWriter};
use super::types::{EventType, ExecutionSubstate, TurnEnd};

/// How long a best-effort `cancel` may take.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the agent to exit after its stream closes.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Collaborators of the orchestrator.
pub struct RuntimeDeps {
    pub namespace: String,
    pub repo_root: PathBuf,
    pub config: Arc<dyn ConfigSource>,
    pub tasks: Arc<dyn TaskRepository>,
    pub substates: Arc<dyn SubstateStore>,
    pub worktrees: Arc<dyn WorktreeManager>,
    pub channels: Arc<dyn ChannelFactory>,
    pub event_logs: Arc<dyn EventLogFactory>,
    pub launcher: Rc<dyn AgentLauncher>,
    pub output: OutputSink,
}

/// Parameters of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub task_id: u64,
    /// Agent to run; the configured default agent when `None`.
    pub agent_name: Option<String>,
    /// Model override; the agent's default model when `None`.
    pub model_override: Option<String>,
}

impl ExecuteRequest {
    pub fn new(task_id: u64) -> Self {
        Self {
            task_id,
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

/// Runs agent sessions.
pub struct Orchestrator {
    deps: RuntimeDeps,
    exit_grace: Duration,
}

/// State shared by the main loop and its exit paths.
struct Session {
    task: Task,
    config: CrewConfig,
    session_id: String,
    connection: Rc<dyn AgentConnection>,
    adapter: ClientAdapter,
    substate: SubstateWriter,
    exec: CancellationToken,
}

enum LoopExit {
    Stopped,
    Exited(Result<ProcessExit, oneshot::error::RecvError>),
    Closed(Result<Option<String>, oneshot::error::RecvError>),
    RouterFailed(IpcError),
    Cancelled,
}

impl Orchestrator {
    pub fn new(deps: RuntimeDeps) -> Self {
        Self {
            deps,
            exit_grace: EXIT_GRACE,
        }
    }

    /// How long to wait for the agent process after it closes its connection.
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Run the agent for a task until it stops, exits or fails.
    ///
    /// Returns the protocol session id. The substate is `Idle` on every
    /// return path once the session has started.
    pub async fn execute(&self, cancel: &CancellationToken, request: ExecuteRequest) -> Result<String, RuntimeError> {
        let local = LocalSet::new();
        local.run_until(self.run(cancel, request)).await
    }

    async fn run(&self, cancel: &CancellationToken, request: ExecuteRequest) -> Result<String, RuntimeError> {
        let deps = &self.deps;
        let task_id = request.task_id;

        // Preconditions.
        let config = deps.config.load()?;
        let task = deps.tasks.get(task_id).await.map_err(RuntimeError::Task)?;
        check_startable(&task, &config)?;

        let agent_name = request
            .agent_name
            .clone()
            .or_else(|| config.default_agent.clone())
            .ok_or(RuntimeError::NoAgentConfigured)?;
        let agent = config
            .agents
            .get(&agent_name)
            .cloned()
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_name.clone()))?;
        if agent.disabled {
            return Err(RuntimeError::AgentDisabled(agent_name));
        }
        let model = agent.resolve_model(request.model_override.as_deref());

        let channel = deps
            .channels
            .open(&deps.namespace, task_id)
            .await
            .map_err(RuntimeError::Channel)?;

        // Worktree and command line.
        let mut compensations = Compensations::new();
        let branch = task.branch_name();
        let worktree = self.ensure_worktree(&task, &branch, &agent, &mut compensations).await?;

        let vars = template_vars(&deps.namespace, &deps.repo_root, &task, &agent_name, model.as_deref(), &branch, &worktree);
        let Some(command) = render_command(&agent.command, &vars) else {
            return Err(rollback(compensations, RuntimeError::EmptyCommand(agent_name)).await);
        };
        compensations.disarm();

        // Spawn and handshake. From here on the agent dies with `exec`.
        let exec = cancel.child_token();
        let _kill_on_exit = exec.clone().drop_guard();

        let substate = SubstateWriter::new(deps.substates.clone(), &deps.namespace, task_id);
        let adapter = ClientAdapter::new(substate.clone(), exec.clone(), deps.output.clone());

        let mut env = agent.env.clone();
        env.insert("CREW_TASK_ID".to_string(), task_id.to_string());
        env.insert("CREW_NAMESPACE".to_string(), deps.namespace.clone());
        env.insert("CREW_WORKTREE".to_string(), worktree.to_string_lossy().to_string());

        let spec = LaunchSpec {
            command,
            cwd: worktree.clone(),
            env,
            cancel: exec.clone(),
        };
        let launched = deps
            .launcher
            .launch(spec, adapter.clone())
            .await
            .map_err(|e| RuntimeError::Handshake(e.to_string()))?;

        let connection = launched.connection.clone();
        let session_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            result = handshake(connection.as_ref(), &worktree) => {
                result.map_err(|e| RuntimeError::Handshake(e.to_string()))?
            }
        };
        info!(task_id, session_id = %session_id, agent = %agent_name, "Agent session started");

        let event_log = deps
            .event_logs
            .create(&deps.namespace, task_id, &session_id)
            .await
            .map_err(|e| RuntimeError::PostHandshake(format!("failed to open event log: {}", e)))?;

        // Record the start; undo it if the task cannot be saved.
        let mut session = Session {
            task,
            config,
            session_id: session_id.clone(),
            connection,
            adapter: adapter.clone(),
            substate,
            exec: exec.clone(),
        };
        self.record_start(&mut session, &agent_name).await?;

        let (router, queues) = spawn_router(channel, exec.clone());
        adapter
            .bind(SessionBinding {
                session_id: session_id.clone(),
                event_log: event_log.clone(),
                permissions: queues.permissions,
                stop: queues.stop.clone(),
            })
            .await;

        let mut exited = launched.exited;
        let mut closed = launched.closed;
        let inputs = LoopInputs {
            prompts: queues.prompts,
            cancels: queues.cancels,
            stop: queues.stop,
            errors: queues.errors,
        };
        let exit = self.main_loop(cancel, &session, inputs, &mut exited, &mut closed).await;
        let result = self.finish(&mut session, exit, &mut exited).await;

        exec.cancel();
        if let Err(e) = event_log.close().await {
            warn!(session_id = %session_id, "Failed to close event log: {}", e);
        }
        if let Err(e) = router.await {
            warn!(session_id = %session_id, "Command router task failed: {}", e);
        }

        result.map(|()| session_id)
    }

    /// Create the worktree if needed, running both setup hooks.
    async fn ensure_worktree(
        &self,
        task: &Task,
        branch: &str,
        agent: &AgentDefinition,
        compensations: &mut Compensations,
    ) -> Result<PathBuf, RuntimeError> {
        let worktrees = &self.deps.worktrees;
        if worktrees.exists(branch).await {
            return worktrees
                .resolve(branch)
                .await
                .map_err(|e| RuntimeError::Setup(e.to_string()));
        }

        let base = worktrees
            .resolve_base(task.base_branch.as_deref())
            .await
            .map_err(|e| RuntimeError::Setup(e.to_string()))?;
        let path = worktrees
            .create(branch, &base)
            .await
            .map_err(|e| RuntimeError::Setup(e.to_string()))?;
        info!(task_id = task.id, branch, path = %path.display(), "Worktree created");

        let remover = worktrees.clone();
        let created = path.clone();
        compensations.push("remove worktree", move || async move { remover.remove(&created).await });

        let setup = async {
            worktrees.setup_worktree(&path).await?;
            if let Some(script) = agent.setup_script.as_deref().filter(|s| !s.trim().is_empty()) {
                let vars = TemplateVars::new()
                    .set("repo", self.deps.repo_root.to_string_lossy())
                    .set("worktree", path.to_string_lossy())
                    .set("branch", branch)
                    .set("task_id", task.id.to_string())
                    .set("namespace", self.deps.namespace.clone());
                run_script(&render(script, &vars), &path, &agent.env).await?;
            }
            Ok::<(), crate::worktree::WorktreeError>(())
        };

        match setup.await {
            Ok(()) => Ok(path),
            Err(e) => {
                let owned = std::mem::take(compensations);
                Err(rollback(owned, RuntimeError::Setup(e.to_string())).await)
            }
        }
    }

    /// Persist `Running` and flip the task to in-progress.
    async fn record_start(&self, session: &mut Session, agent_name: &str) -> Result<(), RuntimeError> {
        let prior = session.task.clone();
        session.task.status = session.config.statuses.in_progress.as_str().into();
        session.task.agent = Some(agent_name.to_string());
        session.task.session = Some(session.session_id.clone());
        session.task.started = Some(Utc::now());

        let saved = match session.substate.set(ExecutionSubstate::Running).await {
            Ok(()) => self.deps.tasks.save(&session.task).await,
            Err(e) => Err(e),
        };

        if let Err(e) = saved {
            warn!(task_id = prior.id, "Failed to record session start, restoring task: {}", e);
            session.task = prior;
            session.substate.reset().await;
            session.exec.cancel();
            return Err(RuntimeError::PostHandshake(e.to_string()));
        }
        Ok(())
    }

    async fn main_loop(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        mut inputs: LoopInputs,
        exited: &mut oneshot::Receiver<ProcessExit>,
        closed: &mut oneshot::Receiver<Option<String>>,
    ) -> LoopExit {
        let (done_tx, mut done_rx) = mpsc::channel::<Result<TurnEnd, ConnectionError>>(QUEUE_CAPACITY);
        let mut queued: VecDeque<String> = VecDeque::new();
        let mut in_flight = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                _ = inputs.stop.cancelled() => return LoopExit::Stopped,
                Some(err) = inputs.errors.recv() => return LoopExit::RouterFailed(err),
                exit = &mut *exited => return LoopExit::Exited(exit),
                result = &mut *closed => return LoopExit::Closed(result),
                Some(result) = done_rx.recv() => {
                    in_flight = false;
                    self.turn_finished(session, result).await;
                    if let Some(text) = queued.pop_front() {
                        self.dispatch_prompt(session, text, &done_tx).await;
                        in_flight = true;
                    }
                }
                Some(()) = inputs.cancels.recv() => {
                    info!(session_id = %session.session_id, "Cancelling current turn");
                    queued.clear();
                    best_effort_cancel(session).await;
                }
                Some(text) = inputs.prompts.recv() => {
                    if in_flight {
                        debug!(queued = queued.len() + 1, "Turn in flight; queueing prompt");
                        queued.push_back(text);
                    } else {
                        self.dispatch_prompt(session, text, &done_tx).await;
                        in_flight = true;
                    }
                }
            }
        }
    }

    async fn dispatch_prompt(
        &self,
        session: &Session,
        text: String,
        done: &mpsc::Sender<Result<TurnEnd, ConnectionError>>,
    ) {
        session.adapter.log_event(EventType::PromptSent, json!({ "text": text })).await;
        if session.substate.current() != ExecutionSubstate::Running {
            set_substate(&session.substate, ExecutionSubstate::Running).await;
        }

        let connection = session.connection.clone();
        let session_id = session.session_id.clone();
        let done = done.clone();
        tokio::task::spawn_local(async move {
            let result = connection.prompt(&session_id, &text).await;
            let _ = done.send(result).await;
        });
    }

    async fn turn_finished(&self, session: &Session, result: Result<TurnEnd, ConnectionError>) {
        match result {
            Ok(reason) => {
                debug!(session_id = %session.session_id, reason = reason.as_str(), "Turn ended");
                session
                    .adapter
                    .log_event(EventType::TurnEnd, json!({ "stop_reason": reason.as_str() }))
                    .await;
            }
            Err(e) => {
                eprintln!("prompt failed: {}", e);
                warn!(session_id = %session.session_id, "Prompt failed: {}", e);
                session
                    .adapter
                    .log_event(EventType::PromptError, json!({ "error": e.to_string() }))
                    .await;
            }
        }
        set_substate(&session.substate, ExecutionSubstate::AwaitingUser).await;
    }

    /// Turn the loop's exit reason into the run's result.
    async fn finish(
        &self,
        session: &mut Session,
        exit: LoopExit,
        exited: &mut oneshot::Receiver<ProcessExit>,
    ) -> Result<(), RuntimeError> {
        match exit {
            LoopExit::Cancelled => {
                info!(session_id = %session.session_id, "Run cancelled by caller");
                session.substate.reset().await;
                Err(RuntimeError::Cancelled)
            }
            LoopExit::Stopped => {
                info!(session_id = %session.session_id, "Stop requested");
                best_effort_cancel(session).await;
                session.substate.reset().await;
                session.exec.cancel();
                Ok(())
            }
            LoopExit::RouterFailed(err) => Err(self.fail_run(session, RuntimeError::Router(err)).await),
            LoopExit::Exited(exit) => {
                let exit = exit.unwrap_or_else(|_| ProcessExit::failure("agent watcher ended unexpectedly"));
                self.settle_exit(session, exit).await
            }
            LoopExit::Closed(result) => {
                if let Ok(Some(err)) = &result {
                    debug!(session_id = %session.session_id, "Protocol stream closed with error: {}", err);
                }
                match tokio::time::timeout(self.exit_grace, exited).await {
                    Ok(exit) => {
                        let exit = exit.unwrap_or_else(|_| ProcessExit::failure("agent watcher ended unexpectedly"));
                        self.settle_exit(session, exit).await
                    }
                    Err(_) => {
                        let err = RuntimeError::AgentExited("agent closed its connection but did not exit".to_string());
                        let err = self.fail_run(session, err).await;
                        session.exec.cancel();
                        Err(err)
                    }
                }
            }
        }
    }

    async fn settle_exit(&self, session: &mut Session, exit: ProcessExit) -> Result<(), RuntimeError> {
        if exit.success || session.exec.is_cancelled() {
            info!(session_id = %session.session_id, status = %exit.description, "Agent exited");
            session.substate.reset().await;
            return Ok(());
        }
        Err(self.fail_run(session, RuntimeError::AgentExited(exit.description)).await)
    }

    /// Mark the task as errored and force `Idle`, keeping both errors if the
    /// task cannot be saved.
    async fn fail_run(&self, session: &mut Session, err: RuntimeError) -> RuntimeError {
        warn!(task_id = session.task.id, "Run failed: {}", err);
        session.task.status = session.config.statuses.error.as_str().into();
        let marked = self.deps.tasks.save(&session.task).await;
        session.substate.reset().await;

        match marked {
            Ok(()) => err,
            Err(e) => err.with_recovery_failure(format!("failed to mark task as error: {}", e)),
        }
    }
}

/// Control queues the main loop waits on.
struct LoopInputs {
    prompts: mpsc::Receiver<String>,
    cancels: mpsc::Receiver<()>,
    stop: CancellationToken,
    errors: mpsc::Receiver<IpcError>,
}

fn check_startable(task: &Task, config: &CrewConfig) -> Result<(), RuntimeError> {
    let policy = &config.statuses;
    if let Some(reason) = &task.block_reason {
        return Err(RuntimeError::TaskBlocked {
            task_id: task.id,
            reason: reason.clone(),
        });
    }
    if policy.is_blocked(task.status.as_str()) {
        return Err(RuntimeError::TaskBlocked {
            task_id: task.id,
            reason: format!("status is {}", task.status),
        });
    }
    if !policy.is_startable(task.status.as_str()) {
        return Err(RuntimeError::TaskNotStartable {
            task_id: task.id,
            status: task.status.to_string(),
        });
    }
    Ok(())
}

fn template_vars(
    namespace: &str,
    repo_root: &Path,
    task: &Task,
    agent_name: &str,
    model: Option<&str>,
    branch: &str,
    worktree: &Path,
) -> TemplateVars {
    TemplateVars::new()
        .set_opt("model", model)
        .set("agent", agent_name)
        .set("task_id", task.id.to_string())
        .set_opt("issue", task.issue.map(|i| i.to_string()))
        .set("title", task.title.clone())
        .set("branch", branch)
        .set("worktree", worktree.to_string_lossy())
        .set("repo", repo_root.to_string_lossy())
        .set("namespace", namespace)
}

async fn handshake(connection: &dyn AgentConnection, cwd: &Path) -> Result<String, ConnectionError> {
    connection.initialize().await?;
    connection.new_session(cwd).await
}

async fn rollback(compensations: Compensations, err: RuntimeError) -> RuntimeError {
    let failures = compensations.unwind().await;
    if failures.is_empty() {
        err
    } else {
        err.with_recovery_failure(failures.join("; "))
    }
}

async fn best_effort_cancel(session: &Session) {
    match tokio::time::timeout(CANCEL_TIMEOUT, session.connection.cancel(&session.session_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(session_id = %session.session_id, "Cancel failed: {}", e),
        Err(_) => warn!(session_id = %session.session_id, "Cancel timed out"),
    }
}

async fn set_substate(writer: &SubstateWriter, state: ExecutionSubstate) {
    if let Err(e) = writer.set(state).await {
        warn!("Failed to persist substate {}: {}", state, e);
    }
}
