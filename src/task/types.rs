// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task record types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse task status.
///
/// The vocabulary belongs to the task lifecycle layer and is configured through
/// [`crate::config::StatusPolicy`]; this is just the stored string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStatus(String);

impl TaskStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    /// Status given to newly created tasks.
    pub fn todo() -> Self {
        Self::new("todo")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A unit of work an agent runs against, scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub namespace: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Upstream issue number, if the task tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<u64>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    /// Explicit branch name; defaults to `crew-<id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Agent label of the current or last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Protocol session id of the current or last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Task {
    /// Create a new task in the `todo` status.
    pub fn new(id: u64, namespace: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            namespace: namespace.into(),
            title: title.into(),
            description: String::new(),
            issue: None,
            status: TaskStatus::todo(),
            block_reason: None,
            branch: None,
            base_branch: None,
            agent: None,
            session: None,
            started: None,
            created: now,
            updated: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<TaskStatus>) -> Self {
        self.status = status.into();
        self
    }

    /// Branch the task's worktree is checked out on.
    pub fn branch_name(&self) -> String {
        self.branch
            .clone()
            .unwrap_or_else(|| format!("crew-{}", self.id))
    }

    pub fn is_blocked(&self) -> bool {
        self.block_reason.is_some()
    }
}
