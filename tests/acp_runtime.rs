// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end tests for the session orchestrator with a scripted agent.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crew::acp::{
    output_sink, AcpCommand, AgentConnection, AgentLauncher, ChannelFactory, ClientAdapter, ConnectionError,
    ControlChannel, EventType, ExecuteRequest, ExecutionSubstate, IpcError, LaunchSpec, LaunchedAgent,
    LocalControlChannel, MemoryEventLog, MemorySubstateStore, Orchestrator, PermissionOption, PermissionOutcome,
    PermissionRequest, ProcessExit, RuntimeDeps, RuntimeError, TurnEnd,
};
use crew::config::{AgentDefinition, CrewConfig};
use crew::error::StoreError;
use crew::task::{Task, TaskRepository};
use crew::worktree::{WorktreeError, WorktreeManager};

use ExecutionSubstate::*;

const NS: &str = "acme-widgets";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct MemoryTasks {
    tasks: Mutex<BTreeMap<u64, Task>>,
    fail_saves: AtomicBool,
}

impl MemoryTasks {
    fn with(task: Task) -> Self {
        let tasks = Self::default();
        tasks.tasks.lock().unwrap().insert(task.id, task);
        tasks
    }

    fn snapshot(&self, id: u64) -> Task {
        self.tasks.lock().unwrap()[&id].clone()
    }
}

#[async_trait]
impl TaskRepository for MemoryTasks {
    async fn get(&self, id: u64) -> Result<Task, StoreError> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Database("disk full".to_string()));
        }
        self.tasks.lock().unwrap().insert(task.id, task.clone());
        Ok(())
    }

    async fn create(&self, title: &str, description: &str, issue: Option<u64>) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.lock().unwrap();
        let id = tasks.keys().max().copied().unwrap_or(0) + 1;
        let mut task = Task::new(id, NS, title).with_description(description);
        task.issue = issue;
        tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.lock().unwrap().values().cloned().collect())
    }
}

/// Worktrees as plain directories under a temp dir.
struct DirWorktrees {
    root: PathBuf,
    fail_setup: bool,
}

impl DirWorktrees {
    fn path(&self, branch: &str) -> PathBuf {
        self.root.join(branch)
    }
}

#[async_trait]
impl WorktreeManager for DirWorktrees {
    async fn exists(&self, branch: &str) -> bool {
        self.path(branch).exists()
    }

    async fn resolve(&self, branch: &str) -> Result<PathBuf, WorktreeError> {
        Ok(self.path(branch))
    }

    async fn resolve_base(&self, requested: Option<&str>) -> Result<String, WorktreeError> {
        Ok(requested.unwrap_or("main").to_string())
    }

    async fn create(&self, branch: &str, _base: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.path(branch);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    async fn setup_worktree(&self, _path: &Path) -> Result<(), WorktreeError> {
        if self.fail_setup {
            return Err(WorktreeError::ScriptFailed {
                status: "exit status: 1".to_string(),
                stderr: "npm install failed".to_string(),
            });
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}

/// Control channel whose first read fails.
struct BrokenChannel;

#[async_trait]
impl ControlChannel for BrokenChannel {
    async fn next(&self, _cancel: &CancellationToken) -> Result<AcpCommand, IpcError> {
        Err(IpcError::Transport("socket reset".to_string()))
    }
}

#[async_trait]
impl ChannelFactory for BrokenChannel {
    async fn open(&self, _namespace: &str, _task_id: u64) -> Result<Arc<dyn ControlChannel>, IpcError> {
        Ok(Arc::new(BrokenChannel))
    }
}

#[derive(Clone, Copy, Default, PartialEq)]
enum Script {
    /// Stream a chunk and end the turn.
    #[default]
    Echo,
    /// Ask for permission before ending the turn.
    AskPermission,
    /// Wait until cancelled.
    Hang,
    /// Fail `initialize`.
    RefuseHandshake,
}

/// Lets a test end the fake agent process.
#[derive(Default)]
struct AgentControls {
    exit: Mutex<Option<oneshot::Sender<ProcessExit>>>,
    close: Mutex<Option<oneshot::Sender<Option<String>>>>,
    spec: Mutex<Option<LaunchSpec>>,
}

impl AgentControls {
    fn exit(&self, exit: ProcessExit) {
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(exit);
        }
    }

    fn close(&self) {
        if let Some(tx) = self.close.lock().unwrap().take() {
            let _ = tx.send(None);
        }
    }
}

struct FakeLauncher {
    script: Script,
    controls: Arc<AgentControls>,
}

#[async_trait(?Send)]
impl AgentLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec, client: ClientAdapter) -> Result<LaunchedAgent, ConnectionError> {
        let (exit_tx, exited) = oneshot::channel();
        let (close_tx, closed) = oneshot::channel();
        *self.controls.exit.lock().unwrap() = Some(exit_tx);
        *self.controls.close.lock().unwrap() = Some(close_tx);
        *self.controls.spec.lock().unwrap() = Some(spec);

        Ok(LaunchedAgent {
            connection: Rc::new(FakeAgent {
                script: self.script,
                client,
                cancelled: Notify::new(),
            }),
            exited,
            closed,
        })
    }
}

struct FakeAgent {
    script: Script,
    client: ClientAdapter,
    cancelled: Notify,
}

#[async_trait(?Send)]
impl AgentConnection for FakeAgent {
    async fn initialize(&self) -> Result<(), ConnectionError> {
        if self.script == Script::RefuseHandshake {
            return Err(ConnectionError::Protocol("unsupported protocol version".to_string()));
        }
        Ok(())
    }

    async fn new_session(&self, _cwd: &Path) -> Result<String, ConnectionError> {
        Ok("sess-1".to_string())
    }

    async fn prompt(&self, _session_id: &str, text: &str) -> Result<TurnEnd, ConnectionError> {
        match self.script {
            Script::Hang => {
                self.cancelled.notified().await;
                return Ok(TurnEnd::Cancelled);
            }
            Script::AskPermission => {
                let request = PermissionRequest::new(vec![
                    PermissionOption::new("allow", "Allow"),
                    PermissionOption::new("reject", "Reject"),
                ]);
                if self.client.request_permission(request).await == PermissionOutcome::Cancelled {
                    return Ok(TurnEnd::Cancelled);
                }
            }
            _ => {}
        }

        self.client
            .record_update(json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": format!("echo: {}", text) }
            }))
            .await;
        Ok(TurnEnd::EndTurn)
    }

    async fn cancel(&self, _session_id: &str) -> Result<(), ConnectionError> {
        self.cancelled.notify_one();
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: TempDir,
    worktree_root: PathBuf,
    tasks: Arc<MemoryTasks>,
    substates: Arc<MemorySubstateStore>,
    channel: LocalControlChannel,
    events: MemoryEventLog,
    controls: Arc<AgentControls>,
    output: SharedBuf,
    orchestrator: Orchestrator,
}

struct Setup {
    task: Task,
    config: CrewConfig,
    script: Script,
    fail_setup: bool,
    broken_channel: bool,
    exit_grace: Option<Duration>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            task: Task::new(1, NS, "Fix parser"),
            config: CrewConfig::new()
                .with_agent("echo", AgentDefinition::new("echo-agent --model {{model}} --task {{task_id}}"))
                .with_default_agent("echo"),
            script: Script::Echo,
            fail_setup: false,
            broken_channel: false,
            exit_grace: None,
        }
    }
}

impl Setup {
    fn build(self) -> Harness {
        let dir = TempDir::new().unwrap();
        let worktree_root = dir.path().to_path_buf();
        let tasks = Arc::new(MemoryTasks::with(self.task));
        let substates = Arc::new(MemorySubstateStore::new());
        let channel = LocalControlChannel::new();
        let events = MemoryEventLog::new();
        let controls = Arc::new(AgentControls::default());
        let output = SharedBuf::default();

        let channels: Arc<dyn ChannelFactory> = if self.broken_channel {
            Arc::new(BrokenChannel)
        } else {
            Arc::new(channel.clone())
        };

        let deps = RuntimeDeps {
            namespace: NS.to_string(),
            repo_root: worktree_root.join("repo"),
            config: Arc::new(self.config),
            tasks: tasks.clone(),
            substates: substates.clone(),
            worktrees: Arc::new(DirWorktrees {
                root: worktree_root.clone(),
                fail_setup: self.fail_setup,
            }),
            channels,
            event_logs: Arc::new(events.clone()),
            launcher: Rc::new(FakeLauncher {
                script: self.script,
                controls: controls.clone(),
            }),
            output: output_sink(output.clone()),
        };

        let mut orchestrator = Orchestrator::new(deps);
        if let Some(grace) = self.exit_grace {
            orchestrator = orchestrator.with_exit_grace(grace);
        }

        Harness {
            _dir: dir,
            worktree_root,
            tasks,
            substates,
            channel,
            events,
            controls,
            output,
            orchestrator,
        }
    }
}

impl Harness {
    async fn run(&self, cancel: &CancellationToken) -> Result<String, RuntimeError> {
        self.orchestrator.execute(cancel, ExecuteRequest::new(1)).await
    }

    fn history(&self) -> Vec<ExecutionSubstate> {
        self.substates.history()
    }
}

/// Poll until `cond` holds, failing after five seconds.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn count(history: &[ExecutionSubstate], state: ExecutionSubstate) -> usize {
    history.iter().filter(|s| **s == state).count()
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn test_prompt_turn_then_stop() {
    let h = Setup::default().build();
    let cancel = CancellationToken::new();

    let channel = h.channel.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        channel.send(AcpCommand::prompt("hello")).await.unwrap();
        wait_until("turn end", || substates.history().contains(&AwaitingUser)).await;
        channel.send(AcpCommand::Stop).await.unwrap();
    });

    let session_id = h.run(&cancel).await.unwrap();
    driver.await.unwrap();

    assert_eq!(session_id, "sess-1");
    assert_eq!(h.history(), vec![Running, AwaitingUser, Idle]);
    assert_eq!(h.output.text(), "echo: hello");
    assert_eq!(
        h.events.types(),
        vec![EventType::PromptSent, EventType::AgentMessageChunk, EventType::TurnEnd]
    );

    let task = h.tasks.snapshot(1);
    assert_eq!(task.status.as_str(), "in_progress");
    assert_eq!(task.agent.as_deref(), Some("echo"));
    assert_eq!(task.session.as_deref(), Some("sess-1"));
    assert!(task.started.is_some());
}

#[tokio::test]
async fn test_launch_spec_carries_rendered_command_and_env() {
    let mut setup = Setup::default();
    setup.config = CrewConfig::new()
        .with_agent(
            "echo",
            AgentDefinition::new("echo-agent --model {{model}} --task {{task_id}}").with_default_model("sonnet"),
        )
        .with_default_agent("echo");
    let h = setup.build();
    let cancel = CancellationToken::new();

    let channel = h.channel.clone();
    let controls = h.controls.clone();
    let driver = tokio::spawn(async move {
        wait_until("launch", || controls.spec.lock().unwrap().is_some()).await;
        channel.send(AcpCommand::Stop).await.unwrap();
    });
    h.run(&cancel).await.unwrap();
    driver.await.unwrap();

    let spec = h.controls.spec.lock().unwrap().clone().unwrap();
    assert_eq!(spec.command, "echo-agent --model sonnet --task 1");
    assert_eq!(spec.cwd, h.worktree_root.join("crew-1"));
    assert_eq!(spec.env.get("CREW_TASK_ID").map(String::as_str), Some("1"));
    assert_eq!(spec.env.get("CREW_NAMESPACE").map(String::as_str), Some(NS));
    assert!(spec.cancel.is_cancelled());
}

#[tokio::test]
async fn test_permission_round_trip() {
    let h = Setup {
        script: Script::AskPermission,
        ..Default::default()
    }
    .build();
    let cancel = CancellationToken::new();

    let channel = h.channel.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        channel.send(AcpCommand::prompt("rm -rf build")).await.unwrap();
        wait_until("permission request", || substates.history().contains(&AwaitingPermission)).await;
        // Not offered; the request keeps waiting.
        channel.send(AcpCommand::permission("always")).await.unwrap();
        channel.send(AcpCommand::permission("allow")).await.unwrap();
        wait_until("turn end", || substates.history().contains(&AwaitingUser)).await;
        channel.send(AcpCommand::Stop).await.unwrap();
    });

    h.run(&cancel).await.unwrap();
    driver.await.unwrap();

    assert_eq!(h.history(), vec![Running, AwaitingPermission, Running, AwaitingUser, Idle]);
    let types = h.events.types();
    assert!(types.contains(&EventType::PermissionRequest));
    assert!(types.contains(&EventType::PermissionSelected));
    assert!(!types.contains(&EventType::PermissionCancelled));
}

#[tokio::test]
async fn test_cancel_command_interrupts_turn() {
    let h = Setup {
        script: Script::Hang,
        ..Default::default()
    }
    .build();
    let cancel = CancellationToken::new();

    let channel = h.channel.clone();
    let events = h.events.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        channel.send(AcpCommand::prompt("long job")).await.unwrap();
        wait_until("prompt sent", || events.types().contains(&EventType::PromptSent)).await;
        channel.send(AcpCommand::Cancel).await.unwrap();
        wait_until("turn end", || substates.history().contains(&AwaitingUser)).await;
        channel.send(AcpCommand::Stop).await.unwrap();
    });

    h.run(&cancel).await.unwrap();
    driver.await.unwrap();

    let turn_end = h
        .events
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::TurnEnd)
        .unwrap();
    assert_eq!(turn_end.payload["stop_reason"], "cancelled");
    assert_eq!(h.history().last(), Some(&Idle));
}

#[tokio::test]
async fn test_follow_up_prompts_run_in_order() {
    let h = Setup::default().build();
    let cancel = CancellationToken::new();

    let channel = h.channel.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        channel.send(AcpCommand::prompt("one")).await.unwrap();
        channel.send(AcpCommand::prompt("two")).await.unwrap();
        wait_until("two turns", || count(&substates.history(), AwaitingUser) == 2).await;
        channel.send(AcpCommand::Stop).await.unwrap();
    });

    h.run(&cancel).await.unwrap();
    driver.await.unwrap();

    assert_eq!(h.output.text(), "echo: oneecho: two");
    assert_eq!(h.history().last(), Some(&Idle));
}

#[tokio::test]
async fn test_clean_agent_exit_ends_run() {
    let h = Setup::default().build();
    let cancel = CancellationToken::new();

    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        wait_until("running", || substates.history().contains(&Running)).await;
        controls.close();
        controls.exit(ProcessExit::success());
    });

    assert_eq!(h.run(&cancel).await.unwrap(), "sess-1");
    driver.await.unwrap();
    assert_eq!(h.history(), vec![Running, Idle]);
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "in_progress");
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn test_precondition_failures_touch_nothing() {
    let blocked = Setup {
        task: Task::new(1, NS, "Fix parser").with_status("blocked"),
        ..Default::default()
    }
    .build();
    let err = blocked.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::TaskBlocked { .. }));
    assert!(err.is_precondition());
    assert!(!blocked.worktree_root.join("crew-1").exists());
    assert!(blocked.history().is_empty());

    let done = Setup {
        task: Task::new(1, NS, "Fix parser").with_status("done"),
        ..Default::default()
    }
    .build();
    let err = done.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::TaskNotStartable { .. }));

    let mut disabled = AgentDefinition::new("echo-agent");
    disabled.disabled = true;
    let off = Setup {
        config: CrewConfig::new().with_agent("echo", disabled).with_default_agent("echo"),
        ..Default::default()
    }
    .build();
    let err = off.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::AgentDisabled(_)));

    let none = Setup {
        config: CrewConfig::new(),
        ..Default::default()
    }
    .build();
    let err = none.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::NoAgentConfigured));
    assert!(err.is_precondition());
    assert!(none.controls.spec.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_agent_is_rejected() {
    let h = Setup::default().build();
    let err = h
        .orchestrator
        .execute(&CancellationToken::new(), ExecuteRequest::new(1).with_agent("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::AgentNotFound(name) if name == "ghost"));
}

#[tokio::test]
async fn test_setup_failure_removes_new_worktree() {
    let h = Setup {
        fail_setup: true,
        ..Default::default()
    }
    .build();

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Setup(ref msg) if msg.contains("npm install failed")));
    assert!(!h.worktree_root.join("crew-1").exists());
    assert!(h.history().is_empty());
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "todo");
}

#[tokio::test]
async fn test_empty_command_removes_new_worktree() {
    let h = Setup {
        config: CrewConfig::new()
            .with_agent("echo", AgentDefinition::new("  {{model}}  "))
            .with_default_agent("echo"),
        ..Default::default()
    }
    .build();

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::EmptyCommand(_)));
    assert!(!h.worktree_root.join("crew-1").exists());
}

#[tokio::test]
async fn test_existing_worktree_is_reused_and_kept_on_handshake_failure() {
    let h = Setup {
        script: Script::RefuseHandshake,
        fail_setup: true,
        ..Default::default()
    }
    .build();
    std::fs::create_dir_all(h.worktree_root.join("crew-1")).unwrap();

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Handshake(_)));
    assert!(h.worktree_root.join("crew-1").exists());
    assert!(h.history().is_empty());
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "todo");

    let spec = h.controls.spec.lock().unwrap().clone().unwrap();
    assert!(spec.cancel.is_cancelled());
}

#[tokio::test]
async fn test_post_handshake_failure_restores_task() {
    let h = Setup::default().build();
    h.tasks.fail_saves.store(true, Ordering::SeqCst);

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::PostHandshake(_)));
    assert_eq!(h.history(), vec![Running, Idle]);

    let task = h.tasks.snapshot(1);
    assert_eq!(task.status.as_str(), "todo");
    assert!(task.session.is_none());
    assert!(task.agent.is_none());
    assert!(task.started.is_none());
}

#[tokio::test]
async fn test_router_failure_marks_task_error() {
    let h = Setup {
        broken_channel: true,
        ..Default::default()
    }
    .build();

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Router(IpcError::Transport(_))));
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "error");
    assert_eq!(h.history().last(), Some(&Idle));
}

#[tokio::test]
async fn test_abnormal_exit_marks_task_error() {
    let h = Setup::default().build();
    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        wait_until("running", || substates.history().contains(&Running)).await;
        controls.exit(ProcessExit::failure("exit status: 3"));
    });

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    driver.await.unwrap();
    assert!(matches!(err, RuntimeError::AgentExited(ref status) if status == "exit status: 3"));
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "error");
    assert_eq!(h.history().last(), Some(&Idle));
}

// ============================================================================
// Connection closed before the process exits
// ============================================================================

/// Wait for the session to run, close the connection, then let the loop see it.
async fn close_connection(controls: &AgentControls, substates: &MemorySubstateStore) {
    wait_until("running", || substates.history().contains(&Running)).await;
    controls.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_close_then_clean_exit_ends_run() {
    let h = Setup::default().build();
    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        close_connection(&controls, &substates).await;
        controls.exit(ProcessExit::success());
    });

    assert_eq!(h.run(&CancellationToken::new()).await.unwrap(), "sess-1");
    driver.await.unwrap();
    assert_eq!(h.history(), vec![Running, Idle]);
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "in_progress");
}

#[tokio::test]
async fn test_close_then_abnormal_exit_marks_task_error() {
    let h = Setup::default().build();
    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        close_connection(&controls, &substates).await;
        controls.exit(ProcessExit::failure("exit status: 9"));
    });

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    driver.await.unwrap();
    assert!(matches!(err, RuntimeError::AgentExited(ref status) if status == "exit status: 9"));
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "error");
    assert_eq!(h.history().last(), Some(&Idle));
}

#[tokio::test]
async fn test_close_then_exit_after_caller_cancel_is_tolerated() {
    let h = Setup::default().build();
    let cancel = CancellationToken::new();

    let caller = cancel.clone();
    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        close_connection(&controls, &substates).await;
        caller.cancel();
        controls.exit(ProcessExit::failure("signal: 15 (SIGTERM)"));
    });

    assert_eq!(h.run(&cancel).await.unwrap(), "sess-1");
    driver.await.unwrap();
    assert_eq!(h.history().last(), Some(&Idle));
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "in_progress");
}

#[tokio::test]
async fn test_close_without_exit_times_out() {
    let h = Setup {
        exit_grace: Some(Duration::from_millis(100)),
        ..Default::default()
    }
    .build();
    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let driver = tokio::spawn(async move {
        wait_until("running", || substates.history().contains(&Running)).await;
        controls.close();
    });

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    driver.await.unwrap();
    assert!(matches!(err, RuntimeError::AgentExited(ref msg) if msg.contains("did not exit")));
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "error");
    assert_eq!(h.history().last(), Some(&Idle));

    let spec = h.controls.spec.lock().unwrap().clone().unwrap();
    assert!(spec.cancel.is_cancelled());
}

#[tokio::test]
async fn test_abnormal_exit_with_failed_save_reports_both() {
    let h = Setup::default().build();
    let controls = h.controls.clone();
    let substates = h.substates.clone();
    let tasks = h.tasks.clone();
    let driver = tokio::spawn(async move {
        wait_until("running", || substates.history().contains(&Running)).await;
        tasks.fail_saves.store(true, Ordering::SeqCst);
        controls.exit(ProcessExit::failure("exit status: 3"));
    });

    let err = h.run(&CancellationToken::new()).await.unwrap_err();
    driver.await.unwrap();
    let msg = err.to_string();
    assert!(matches!(err, RuntimeError::Compound { .. }));
    assert!(msg.contains("exit status: 3"));
    assert!(msg.contains("disk full"));
    assert_eq!(h.history().last(), Some(&Idle));
}

#[tokio::test]
async fn test_caller_cancellation_during_permission_wait() {
    let h = Setup {
        script: Script::AskPermission,
        ..Default::default()
    }
    .build();
    let cancel = CancellationToken::new();

    let channel = h.channel.clone();
    let substates = h.substates.clone();
    let caller = cancel.clone();
    let driver = tokio::spawn(async move {
        channel.send(AcpCommand::prompt("deploy")).await.unwrap();
        wait_until("permission request", || substates.history().contains(&AwaitingPermission)).await;
        caller.cancel();
    });

    let err = h.run(&cancel).await.unwrap_err();
    driver.await.unwrap();
    assert!(err.is_cancelled());
    assert_eq!(h.history().last(), Some(&Idle));
    assert_eq!(h.tasks.snapshot(1).status.as_str(), "in_progress");
}
