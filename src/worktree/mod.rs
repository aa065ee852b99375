// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-task git worktrees.
//!
//! Each task runs in its own worktree, checked out on the task's branch in a
//! sibling directory of the main repository:
//!
//! ```text
//! /src/project/            # Main repo
//! /src/crew-crew-42/       # Worktree for branch crew-42
//! /src/crew-feat-login/    # Worktree for branch feat/login
//! ```

mod git;
mod script;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub use git::GitWorktreeManager;
pub use script::run_script;

/// Errors from worktree and hook operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Worktree not found for branch: {0}")]
    NotFound(String),

    #[error("Directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Base branch not found: {0}")]
    BaseNotFound(String),

    #[error("Script failed ({status}): {stderr}")]
    ScriptFailed { status: String, stderr: String },
}

/// Operations the session runtime needs from the worktree layer.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Whether a worktree is checked out for the branch.
    async fn exists(&self, branch: &str) -> bool;

    /// Path of the existing worktree for the branch.
    async fn resolve(&self, branch: &str) -> Result<PathBuf, WorktreeError>;

    /// Pick the base branch for a new worktree, preferring `requested`.
    async fn resolve_base(&self, requested: Option<&str>) -> Result<String, WorktreeError>;

    /// Create a worktree for `branch` from `base` and return its path.
    async fn create(&self, branch: &str, base: &str) -> Result<PathBuf, WorktreeError>;

    /// Run the workspace's worktree setup hook inside a fresh worktree.
    async fn setup_worktree(&self, path: &Path) -> Result<(), WorktreeError>;

    /// Remove a worktree directory and its git bookkeeping.
    async fn remove(&self, path: &Path) -> Result<(), WorktreeError>;
}

/// Sanitize a branch name for use as a directory name.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Sibling directory a branch's worktree lives in.
pub fn worktree_path_for_branch(repo_root: &Path, branch: &str, prefix: &str) -> PathBuf {
    let dir_name = format!("{}{}", prefix, sanitize_branch_name(branch));
    repo_root.parent().unwrap_or(repo_root).join(dir_name)
}

/// Walk up from `path` to the directory holding `.git`.
pub fn find_repo_root(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}
