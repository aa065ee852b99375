// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crew main entry point - task and agent session commands.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use crew::acp::event_log::{latest_log, log_file_name, read_events, task_log_dir};
use crew::acp::{
    stdout_sink, AcpCommand, ExecuteRequest, ExecutionSubstate, IpcSender, JsonlLogFactory, Orchestrator,
    ProcessLauncher, RuntimeDeps, SocketChannelFactory, SqliteSubstateStore, SubstateStore,
};
use crew::config::{self, CliOptions, CrewConfig, FileConfigSource};
use crew::namespace::derive_namespace;
use crew::store::Database;
use crew::task::{SqliteTaskRepository, TaskRepository};
use crew::telemetry::{init_telemetry, TelemetryConfig};
use crew::worktree::{find_repo_root, GitWorktreeManager};

/// Crew - run coding agents against tasks.
#[derive(Parser)]
#[command(name = "crew")]
#[command(author, version, about = "Run coding agents against tasks, one worktree each", long_about = None)]
struct Cli {
    /// Agent to use when none is given
    #[arg(long, global = true, env = "CREW_AGENT")]
    default_agent: Option<String>,

    /// Base branch for new worktrees
    #[arg(long, global = true, env = "CREW_BASE_BRANCH")]
    base_branch: Option<String>,

    /// Directory for the database, sockets and logs
    #[arg(long, global = true, env = "CREW_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Log filter directive (e.g. `crew::acp=trace`); overrides RUST_LOG
    #[arg(long, global = true, env = "CREW_LOG")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Run and steer agent sessions
    Acp {
        #[command(subcommand)]
        action: AcpAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task
    Add {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Upstream issue number
        #[arg(long)]
        issue: Option<u64>,
        /// Branch to work on (defaults to crew-<id>)
        #[arg(long)]
        branch: Option<String>,
    },
    /// List tasks
    List,
    /// Show one task
    Show { id: u64 },
}

#[derive(Subcommand)]
enum AcpAction {
    /// Run an agent session for a task until it stops
    Start {
        task_id: u64,
        /// Agent to run
        #[arg(short, long)]
        agent: Option<String>,
        /// Model override
        #[arg(short, long)]
        model: Option<String>,
        /// Cancel the session after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Send a prompt to a running session
    Prompt { task_id: u64, text: String },
    /// Answer a pending permission request
    Permission { task_id: u64, option_id: String },
    /// Cancel the current turn
    Cancel { task_id: u64 },
    /// Stop the session
    Stop { task_id: u64 },
    /// Show the execution substate
    Status { task_id: u64 },
    /// Print a session's event log
    Log {
        task_id: u64,
        /// Session id (defaults to the most recent)
        #[arg(long)]
        session: Option<String>,
    },
}

/// Resolved workspace context shared by all commands.
struct Workspace {
    root: PathBuf,
    namespace: String,
    cli: CliOptions,
    config: CrewConfig,
}

impl Workspace {
    async fn discover(cli: CliOptions) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let root = find_repo_root(&cwd).unwrap_or(cwd);
        let config = config::load_config(&root, cli.clone()).context("failed to load configuration")?;
        let namespace = derive_namespace(&root).await;
        Ok(Self {
            root,
            namespace,
            cli,
            config,
        })
    }

    fn database(&self) -> anyhow::Result<Database> {
        let path = self.config.database_path();
        Database::open(&path).with_context(|| format!("failed to open database {}", path.display()))
    }

    fn tasks(&self) -> anyhow::Result<SqliteTaskRepository> {
        Ok(SqliteTaskRepository::new(self.database()?, self.namespace.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = if cli.verbose || cli.debug {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::default()
    };
    if let Some(filter) = cli.log_filter {
        telemetry = telemetry.with_filter(filter);
    }
    init_telemetry(&telemetry.with_ansi(std::io::stderr().is_terminal()))?;

    let options = CliOptions {
        default_agent: cli.default_agent,
        base_branch: cli.base_branch,
        state_dir: cli.state_dir,
    };
    let workspace = Workspace::discover(options).await?;

    match cli.command {
        Commands::Task { action } => handle_task(&workspace, action).await,
        Commands::Acp { action } => handle_acp(&workspace, action).await,
    }
}

async fn handle_task(ws: &Workspace, action: TaskAction) -> anyhow::Result<()> {
    let tasks = ws.tasks()?;
    match action {
        TaskAction::Add {
            title,
            description,
            issue,
            branch,
        } => {
            let mut task = tasks.create(&title, &description, issue).await?;
            if branch.is_some() {
                task.branch = branch;
                tasks.save(&task).await?;
            }
            println!("{} task {} ({})", "Created".green(), task.id, task.branch_name());
        }
        TaskAction::List => {
            let all = tasks.list().await?;
            if all.is_empty() {
                println!("{}", format!("No tasks in {}", ws.namespace).dimmed());
            }
            for task in all {
                println!("{:>4}  {:<12} {}", task.id, task.status.to_string().cyan(), task.title);
            }
        }
        TaskAction::Show { id } => {
            let task = tasks.get(id).await.with_context(|| format!("task {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
    }
    Ok(())
}

async fn handle_acp(ws: &Workspace, action: AcpAction) -> anyhow::Result<()> {
    let sender = IpcSender::new(ws.config.ipc_dir());
    let (task_id, cmd) = match action {
        AcpAction::Start {
            task_id,
            agent,
            model,
            timeout,
        } => return start_session(ws, task_id, agent, model, timeout).await,
        AcpAction::Status { task_id } => return show_status(ws, task_id).await,
        AcpAction::Log { task_id, session } => return show_log(ws, task_id, session),
        AcpAction::Prompt { task_id, text } => (task_id, AcpCommand::prompt(text)),
        AcpAction::Permission { task_id, option_id } => (task_id, AcpCommand::permission(option_id)),
        AcpAction::Cancel { task_id } => (task_id, AcpCommand::Cancel),
        AcpAction::Stop { task_id } => (task_id, AcpCommand::Stop),
    };

    sender
        .send(&ws.namespace, task_id, &cmd)
        .await
        .with_context(|| format!("failed to send {} to task {}", cmd.kind(), task_id))?;
    println!("{} {}", "✓".green(), cmd.kind());
    Ok(())
}

async fn start_session(
    ws: &Workspace,
    task_id: u64,
    agent: Option<String>,
    model: Option<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let db = ws.database()?;
    let config = &ws.config;

    let worktrees = GitWorktreeManager::new(&ws.root)
        .with_prefix(config.worktree.prefix.clone())
        .with_base_branch(config.base_branch.clone())
        .with_setup_script(config.worktree.setup_script.clone());

    let deps = RuntimeDeps {
        namespace: ws.namespace.clone(),
        repo_root: ws.root.clone(),
        config: Arc::new(FileConfigSource::new(&ws.root, ws.cli.clone())),
        tasks: Arc::new(SqliteTaskRepository::new(db.clone(), ws.namespace.clone())),
        substates: Arc::new(SqliteSubstateStore::new(db)),
        worktrees: Arc::new(worktrees),
        channels: Arc::new(SocketChannelFactory::new(config.ipc_dir())),
        event_logs: Arc::new(JsonlLogFactory::new(config.log_dir())),
        launcher: Rc::new(ProcessLauncher::new()),
        output: stdout_sink(),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, shutting down session".yellow());
            on_signal.cancel();
        }
    });
    if let Some(secs) = timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            on_timeout.cancel();
        });
    }

    let mut request = ExecuteRequest::new(task_id);
    request.agent_name = agent;
    request.model_override = model;

    let orchestrator = Orchestrator::new(deps);
    match orchestrator.execute(&cancel, request).await {
        Ok(session_id) => {
            eprintln!("{} session {} ended", "✓".green(), session_id);
            Ok(())
        }
        Err(e) if e.is_precondition() => {
            eprintln!("{} {}", "✗".red(), e.to_string().red());
            bail!("task {} was not started; nothing was changed", task_id)
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e.to_string().red());
            bail!("session for task {} failed", task_id)
        }
    }
}

async fn show_status(ws: &Workspace, task_id: u64) -> anyhow::Result<()> {
    let store = SqliteSubstateStore::new(ws.database()?);
    let state = match store.load(&ws.namespace, task_id).await {
        Ok(state) => state,
        Err(e) if e.is_not_found() => ExecutionSubstate::Idle,
        Err(e) => return Err(e).context("failed to load substate"),
    };
    println!("{}", state);
    Ok(())
}

fn show_log(ws: &Workspace, task_id: u64, session: Option<String>) -> anyhow::Result<()> {
    let dir = task_log_dir(&ws.config.log_dir(), &ws.namespace, task_id);
    let path = match session {
        Some(id) => dir.join(log_file_name(&id)),
        None => match latest_log(&dir)? {
            Some(path) => path,
            None => {
                println!("{}", format!("No sessions recorded for task {}", task_id).dimmed());
                return Ok(());
            }
        },
    };

    let events = read_events(&path).with_context(|| format!("failed to read {}", path.display()))?;
    for event in events {
        println!(
            "{} {:<22} {}",
            event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            event.event_type.as_str().cyan(),
            event.payload
        );
    }
    Ok(())
}
