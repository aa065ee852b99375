// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution substate persistence.
//!
//! The substate outlives the process that wrote it so that other CLI
//! invocations can answer "what is this agent waiting on?" without talking
//! to the agent. Writes are last-writer-wins; only one run per task writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::Database;

use super::types::ExecutionSubstate;

/// Durable (namespace, task) -> substate record.
#[async_trait]
pub trait SubstateStore: Send + Sync {
    /// Load the current substate. Fails with [`StoreError::NotFound`] if the
    /// task has never run.
    async fn load(&self, namespace: &str, task_id: u64) -> Result<ExecutionSubstate, StoreError>;

    async fn save(&self, namespace: &str, task_id: u64, state: ExecutionSubstate) -> Result<(), StoreError>;
}

/// Substate store backed by the shared SQLite database.
#[derive(Clone)]
pub struct SqliteSubstateStore {
    db: Database,
}

impl SqliteSubstateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubstateStore for SqliteSubstateStore {
    async fn load(&self, namespace: &str, task_id: u64) -> Result<ExecutionSubstate, StoreError> {
        let conn = self.db.lock()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM execution_substates WHERE namespace = ? AND task_id = ?",
                params![namespace, task_id as i64],
                |row| row.get(0),
            )
            .optional()?;

        match state {
            Some(s) => s.parse().map_err(StoreError::Corrupted),
            None => Err(StoreError::NotFound(format!("substate for task {} in {}", task_id, namespace))),
        }
    }

    async fn save(&self, namespace: &str, task_id: u64, state: ExecutionSubstate) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        conn.execute(
            r#"
            INSERT INTO execution_substates (namespace, task_id, state, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, task_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
            params![namespace, task_id as i64, state.as_str(), Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

/// In-memory store that also keeps every write in order.
#[derive(Default)]
pub struct MemorySubstateStore {
    states: Mutex<HashMap<(String, u64), ExecutionSubstate>>,
    history: Mutex<Vec<ExecutionSubstate>>,
}

impl MemorySubstateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state saved so far, oldest first.
    pub fn history(&self) -> Vec<ExecutionSubstate> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("substate mutex poisoned".to_string())
}

#[async_trait]
impl SubstateStore for MemorySubstateStore {
    async fn load(&self, namespace: &str, task_id: u64) -> Result<ExecutionSubstate, StoreError> {
        let states = self.states.lock().map_err(poisoned)?;
        states
            .get(&(namespace.to_string(), task_id))
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("substate for task {}", task_id)))
    }

    async fn save(&self, namespace: &str, task_id: u64, state: ExecutionSubstate) -> Result<(), StoreError> {
        self.states
            .lock()
            .map_err(poisoned)?
            .insert((namespace.to_string(), task_id), state);
        self.history.lock().map_err(poisoned)?.push(state);
        Ok(())
    }
}

/// Writer bound to one task for the length of a run.
///
/// Tracks the last state it wrote and warns about transitions the state
/// machine does not allow. The write still happens: the store is
/// last-writer-wins and the run must always be able to reach `Idle`.
#[derive(Clone)]
pub struct SubstateWriter {
    store: Arc<dyn SubstateStore>,
    namespace: String,
    task_id: u64,
    last: Arc<Mutex<ExecutionSubstate>>,
}

impl SubstateWriter {
    pub fn new(store: Arc<dyn SubstateStore>, namespace: impl Into<String>, task_id: u64) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            task_id,
            last: Arc::new(Mutex::new(ExecutionSubstate::Idle)),
        }
    }

    /// Last state written by this writer.
    pub fn current(&self) -> ExecutionSubstate {
        self.last.lock().map(|s| *s).unwrap_or_default()
    }

    pub async fn set(&self, next: ExecutionSubstate) -> Result<(), StoreError> {
        let prev = self.current();
        if !prev.can_transition_to(next) {
            warn!(
                task_id = self.task_id,
                from = %prev,
                to = %next,
                "Unexpected substate transition"
            );
        }

        self.store.save(&self.namespace, self.task_id, next).await?;
        if let Ok(mut last) = self.last.lock() {
            *last = next;
        }
        debug!(task_id = self.task_id, from = %prev, to = %next, "Substate updated");
        Ok(())
    }

    /// Force `Idle`, logging instead of failing.
    pub async fn reset(&self) {
        if let Err(e) = self.set(ExecutionSubstate::Idle).await {
            warn!(task_id = self.task_id, "Failed to reset substate to idle: {}", e);
        }
    }
}
