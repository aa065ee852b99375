// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Namespace derivation.
//!
//! Task ids, substates and control sockets are partitioned by a namespace
//! derived from the repository's remote identity, so two clones of the same
//! project share tasks while unrelated repositories never collide.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Fallback when neither the remote nor the directory yields a usable name.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Derive the namespace for a repository.
///
/// Uses `git remote get-url origin` (`git@github.com:org/repo.git` becomes
/// `org-repo`), falling back to the directory name.
pub async fn derive_namespace(repo_root: &Path) -> String {
    if let Some(url) = origin_url(repo_root).await {
        if let Some(ns) = namespace_from_remote(&url) {
            return ns;
        }
    }

    let from_dir = repo_root
        .file_name()
        .map(|name| sanitize(&name.to_string_lossy()))
        .unwrap_or_default();
    if from_dir.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        from_dir
    }
}

async fn origin_url(repo_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(repo_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        debug!("No origin remote in {}", repo_root.display());
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!url.is_empty()).then_some(url)
}

/// Extract `owner-repo` from an https, ssh or scp-style remote URL.
pub fn namespace_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    // scp-style `git@host:owner/repo` uses ':' before the path.
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path)?,
        None => trimmed.rsplit_once(':').map(|(_, path)| path).unwrap_or(trimmed),
    };

    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let repo = segments.next()?;
    let ns = match segments.next() {
        Some(owner) => sanitize(&format!("{}-{}", owner, repo)),
        None => sanitize(repo),
    };
    (!ns.is_empty()).then_some(ns)
}

/// Lowercase and restrict to `[a-z0-9-]`, collapsing runs of other characters.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
