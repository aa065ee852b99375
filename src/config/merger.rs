// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use super::types::{CrewConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub default_agent: Option<String>,
    pub base_branch: Option<String>,
    pub state_dir: Option<PathBuf>,
}

/// Default configuration values.
pub fn default_config() -> CrewConfig {
    CrewConfig::new()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.crew.local.json)
/// 3. Workspace config (.crew.json)
/// 4. Global config (~/.crew/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> CrewConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut CrewConfig, config: &WorkspaceConfig) {
    if config.default_agent.is_some() {
        result.default_agent = config.default_agent.clone();
    }

    if let Some(ref branch) = config.base_branch {
        result.base_branch = branch.clone();
    }

    if config.state_dir.is_some() {
        result.state_dir = config.state_dir.clone();
    }

    if let Some(ref worktree) = config.worktree {
        if let Some(ref prefix) = worktree.prefix {
            result.worktree.prefix = prefix.clone();
        }
        if worktree.setup_script.is_some() {
            result.worktree.setup_script = worktree.setup_script.clone();
        }
    }

    if let Some(ref statuses) = config.statuses {
        if let Some(ref startable) = statuses.startable {
            result.statuses.startable = startable.clone();
        }
        if let Some(ref blocked) = statuses.blocked {
            result.statuses.blocked = blocked.clone();
        }
        if let Some(ref in_progress) = statuses.in_progress {
            result.statuses.in_progress = in_progress.clone();
        }
        if let Some(ref error) = statuses.error {
            result.statuses.error = error.clone();
        }
    }

    // Agents are merged by name; a later source replaces the whole definition.
    if let Some(ref agents) = config.agents {
        for (name, agent) in agents {
            result.agents.insert(name.clone(), agent.clone());
        }
    }
}

fn apply_cli_options(result: &mut CrewConfig, cli: &CliOptions) {
    if cli.default_agent.is_some() {
        result.default_agent = cli.default_agent.clone();
    }

    if let Some(ref branch) = cli.base_branch {
        result.base_branch = branch.clone();
    }

    if cli.state_dir.is_some() {
        result.state_dir = cli.state_dir.clone();
    }
}
