// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of workspace (file) and resolved configuration,
//! supporting JSON and YAML formats.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Workspace configuration for crew.
/// Can be defined in .crew.json or .crew/config.yaml in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Agent used when `crew acp start` is given no `--agent`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,

    /// Branch new worktrees are created from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Where the task database, IPC sockets and event logs live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Worktree placement and setup hook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeConfig>,

    /// Status vocabulary of the surrounding task lifecycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<StatusConfig>,

    /// Named agent definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<BTreeMap<String, AgentDefinition>>,
}

/// Worktree section as written in a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Shell snippet run inside a freshly created worktree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
}

/// Status vocabulary as written in a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startable: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A coding agent that speaks ACP over stdio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    /// Command line template, e.g. `claude-code-acp --model {{model}}`
    pub command: String,

    /// Model used when no override is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Script run once inside a newly created worktree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Extra environment for the agent process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl AgentDefinition {
    /// Create an agent definition from a command template.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_setup_script(mut self, script: impl Into<String>) -> Self {
        self.setup_script = Some(script.into());
        self
    }

    /// Resolve the model: explicit override wins over the agent default.
    pub fn resolve_model(&self, model_override: Option<&str>) -> Option<String> {
        model_override
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
    }
}

/// Resolved worktree settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeSettings {
    pub prefix: String,
    pub setup_script: Option<String>,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            prefix: "crew-".to_string(),
            setup_script: None,
        }
    }
}

/// Resolved status vocabulary.
///
/// The session runtime never hard-codes status names; it only asks whether a
/// status is startable or blocked and which names mean "in progress" and "error".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolicy {
    pub startable: Vec<String>,
    pub blocked: String,
    pub in_progress: String,
    pub error: String,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            startable: vec![
                "todo".to_string(),
                "in_progress".to_string(),
                "error".to_string(),
            ],
            blocked: "blocked".to_string(),
            in_progress: "in_progress".to_string(),
            error: "error".to_string(),
        }
    }
}

impl StatusPolicy {
    pub fn is_startable(&self, status: &str) -> bool {
        self.startable.iter().any(|s| s == status)
    }

    pub fn is_blocked(&self, status: &str) -> bool {
        self.blocked == status
    }
}

/// Fully resolved configuration with all defaults applied.
#[derive(Debug, Clone, Default)]
pub struct CrewConfig {
    pub default_agent: Option<String>,
    pub base_branch: String,
    pub state_dir: Option<PathBuf>,
    pub worktree: WorktreeSettings,
    pub statuses: StatusPolicy,
    pub agents: BTreeMap<String, AgentDefinition>,
}

/// Default state directory name under the home directory.
pub const STATE_DIR_NAME: &str = ".crew";

impl CrewConfig {
    /// Create the default configuration (base branch `main`).
    pub fn new() -> Self {
        Self {
            base_branch: "main".to_string(),
            ..Default::default()
        }
    }

    /// Register an agent definition.
    pub fn with_agent(mut self, name: impl Into<String>, agent: AgentDefinition) -> Self {
        self.agents.insert(name.into(), agent);
        self
    }

    pub fn with_default_agent(mut self, name: impl Into<String>) -> Self {
        self.default_agent = Some(name.into());
        self
    }

    /// Directory holding the database, sockets and event logs.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(STATE_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(STATE_DIR_NAME))
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir().join("crew.db")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.state_dir().join("ipc")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("acp-logs")
    }
}
