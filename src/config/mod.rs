// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for crew.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.crew/config.json (or .yaml)
//! - Workspace config: .crew.json, .crew/config.json, .crew/config.yaml or crew.config.json
//! - Local config: .crew.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
pub mod template;
mod types;

pub use loader::{
    get_global_config_dir, load_config_file, load_global_config, load_local_config,
    load_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_FILES, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use template::{render, render_command, TemplateVars};

pub use types::{
    AgentDefinition, CrewConfig, StatusConfig, StatusPolicy, WorkspaceConfig, WorktreeConfig,
    WorktreeSettings, STATE_DIR_NAME,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Load and merge all configuration sources for a workspace.
///
/// This is the main entry point for configuration loading.
pub fn load_config(workspace_root: &Path, cli_options: CliOptions) -> Result<CrewConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    Ok(merge_config(global, workspace, local, cli_options))
}

/// Something that can produce the effective configuration for a run.
///
/// The session runtime reloads configuration at the start of every run so that
/// edits to agent definitions take effect without restarting anything.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<CrewConfig, ConfigError>;
}

impl ConfigSource for CrewConfig {
    fn load(&self) -> Result<CrewConfig, ConfigError> {
        Ok(self.clone())
    }
}

/// Reads configuration files from disk on every `load`.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    workspace_root: PathBuf,
    cli: CliOptions,
}

impl FileConfigSource {
    pub fn new(workspace_root: impl Into<PathBuf>, cli: CliOptions) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cli,
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<CrewConfig, ConfigError> {
        load_config(&self.workspace_root, self.cli.clone())
    }
}
