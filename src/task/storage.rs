// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-based task repository.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::StoreError;
use crate::store::Database;

use super::types::Task;
use super::TaskRepository;

/// Task repository scoped to one namespace.
#[derive(Clone)]
pub struct SqliteTaskRepository {
    db: Database,
    namespace: String,
}

impl SqliteTaskRepository {
    pub fn new(db: Database, namespace: impl Into<String>) -> Self {
        Self {
            db,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn get(&self, id: u64) -> Result<Task, StoreError> {
        let conn = self.db.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM tasks WHERE namespace = ? AND id = ?",
                params![self.namespace, id as i64],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::NotFound(format!("task {} in {}", id, self.namespace))),
        }
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let mut task = task.clone();
        task.updated = Utc::now();
        let data = serde_json::to_string(&task)?;

        let conn = self.db.lock()?;
        conn.execute(
            r#"
            INSERT INTO tasks (namespace, id, data, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
            params![self.namespace, task.id as i64, data, task.updated.timestamp()],
        )?;
        Ok(())
    }

    async fn create(&self, title: &str, description: &str, issue: Option<u64>) -> Result<Task, StoreError> {
        let next_id: i64 = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT COALESCE(MAX(id), 0) + 1 FROM tasks WHERE namespace = ?",
                params![self.namespace],
                |row| row.get(0),
            )?
        };

        let mut task = Task::new(next_id as u64, &self.namespace, title).with_description(description);
        task.issue = issue;
        self.save(&task).await?;
        Ok(task)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare("SELECT data FROM tasks WHERE namespace = ? ORDER BY id")?;
        let rows = stmt.query_map(params![self.namespace], |row| row.get::<_, String>(0))?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_str(&row?)?);
        }
        Ok(tasks)
    }
}
