// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task records.
//!
//! The session runtime only reads a task's status, block reason and identity,
//! and writes back status plus the agent/session labels of a run. Everything
//! else about the task lifecycle lives outside the runtime.

mod storage;
mod types;

use async_trait::async_trait;

use crate::error::StoreError;

pub use storage::SqliteTaskRepository;
pub use types::{Task, TaskStatus};

/// CRUD access to tasks within one namespace.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Load a task. Fails with [`StoreError::NotFound`] if it does not exist.
    async fn get(&self, id: u64) -> Result<Task, StoreError>;

    /// Insert or overwrite a task.
    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    /// Create a task with the next free id.
    async fn create(&self, title: &str, description: &str, issue: Option<u64>) -> Result<Task, StoreError>;

    /// All tasks, ordered by id.
    async fn list(&self) -> Result<Vec<Task>, StoreError>;
}
