// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `git worktree` backed manager.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{run_script, worktree_path_for_branch, WorktreeError, WorktreeManager};

/// Worktree manager for a single repository.
pub struct GitWorktreeManager {
    repo_root: PathBuf,
    prefix: String,
    base_branch: String,
    setup_script: Option<String>,
}

impl GitWorktreeManager {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            prefix: "crew-".to_string(),
            base_branch: "main".to_string(),
            setup_script: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Fallback base branch when a task does not name one.
    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self
    }

    /// Hook run inside each newly created worktree.
    pub fn with_setup_script(mut self, script: Option<String>) -> Self {
        self.setup_script = script.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Where a worktree for `branch` is created.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        worktree_path_for_branch(&self.repo_root, branch, &self.prefix)
    }

    /// Run a git command in the main repository and return trimmed stdout.
    async fn git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(WorktreeError::Git(stderr.trim().to_string()))
        }
    }

    async fn ref_exists(&self, name: &str) -> bool {
        self.git(&["rev-parse", "--verify", "--quiet", name]).await.is_ok()
    }

    /// Path of the registered worktree that has `branch` checked out.
    async fn find_worktree(&self, branch: &str) -> Result<Option<PathBuf>, WorktreeError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output)
            .into_iter()
            .find(|(_, b)| b.as_deref() == Some(branch))
            .map(|(path, _)| path)
            .filter(|path| path != &self.repo_root))
    }
}

/// Parse `git worktree list --porcelain` into (path, branch) pairs.
fn parse_worktree_list(output: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut entries = Vec::new();
    let mut current: Option<(PathBuf, Option<String>)> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some((PathBuf::from(path), None));
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some((_, b)) = current.as_mut() {
                *b = Some(branch.to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

#[async_trait]
impl WorktreeManager for GitWorktreeManager {
    async fn exists(&self, branch: &str) -> bool {
        match self.find_worktree(branch).await {
            Ok(found) => found.is_some_and(|path| path.exists()),
            Err(e) => {
                warn!("Failed to list worktrees: {}", e);
                false
            }
        }
    }

    async fn resolve(&self, branch: &str) -> Result<PathBuf, WorktreeError> {
        self.find_worktree(branch)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(branch.to_string()))
    }

    async fn resolve_base(&self, requested: Option<&str>) -> Result<String, WorktreeError> {
        let candidates = requested
            .into_iter()
            .chain(std::iter::once(self.base_branch.as_str()));

        for candidate in candidates {
            if self.ref_exists(candidate).await {
                return Ok(candidate.to_string());
            }
            debug!(base = candidate, "Base branch candidate not found");
        }

        Err(WorktreeError::BaseNotFound(
            requested.unwrap_or(&self.base_branch).to_string(),
        ))
    }

    async fn create(&self, branch: &str, base: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.worktree_path(branch);
        if path.exists() {
            return Err(WorktreeError::AlreadyExists(path));
        }

        info!(branch, path = %path.display(), "Creating worktree");
        let path_str = path.to_string_lossy().to_string();

        if self.ref_exists(branch).await {
            self.git(&["worktree", "add", &path_str, branch]).await?;
        } else {
            self.git(&["worktree", "add", "-b", branch, &path_str, base]).await?;
        }

        Ok(path)
    }

    async fn setup_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let Some(script) = &self.setup_script else {
            return Ok(());
        };

        let mut env = BTreeMap::new();
        env.insert("CREW_REPO".to_string(), self.repo_root.to_string_lossy().to_string());
        env.insert("CREW_WORKTREE".to_string(), path.to_string_lossy().to_string());
        run_script(script, path, &env).await
    }

    async fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        info!(path = %path.display(), "Removing worktree");
        let path_str = path.to_string_lossy().to_string();

        if let Err(e) = self.git(&["worktree", "remove", "--force", &path_str]).await {
            warn!("git worktree remove failed, deleting directory: {}", e);
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }

        Ok(())
    }
}
