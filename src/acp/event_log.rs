// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only protocol event log.
//!
//! Logs are JSON Lines, one file per session:
//! `<state_dir>/acp-logs/<namespace>/<task>/<session>.jsonl`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::types::{AcpEvent, EventType};

/// Sink for one session's events.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn write(&self, event: &AcpEvent) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
}

/// Creates the event log for a new session.
#[async_trait]
pub trait EventLogFactory: Send + Sync {
    async fn create(&self, namespace: &str, task_id: u64, session_id: &str) -> io::Result<Arc<dyn EventLog>>;
}

/// Directory holding every session log of a task.
pub fn task_log_dir(log_root: &Path, namespace: &str, task_id: u64) -> PathBuf {
    log_root.join(namespace).join(task_id.to_string())
}

/// File name of a session's log. The session id is agent-supplied: characters
/// outside `[A-Za-z0-9._-]` become `_` and leading dots are dropped.
pub fn log_file_name(session_id: &str) -> String {
    let stem: String = session_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "session.jsonl".to_string()
    } else {
        format!("{}.jsonl", stem)
    }
}

/// JSON Lines file log.
pub struct JsonlEventLog {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonlEventLog {
    /// Open (or append to) the log at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        debug!("Event log opened at {}", path.display());
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn write(&self, event: &AcpEvent) -> io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "event log closed"))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Creates [`JsonlEventLog`]s under a log root.
#[derive(Debug, Clone)]
pub struct JsonlLogFactory {
    log_root: PathBuf,
}

impl JsonlLogFactory {
    pub fn new(log_root: impl Into<PathBuf>) -> Self {
        Self { log_root: log_root.into() }
    }
}

#[async_trait]
impl EventLogFactory for JsonlLogFactory {
    async fn create(&self, namespace: &str, task_id: u64, session_id: &str) -> io::Result<Arc<dyn EventLog>> {
        let path = task_log_dir(&self.log_root, namespace, task_id).join(log_file_name(session_id));
        Ok(Arc::new(JsonlEventLog::open(path).await?))
    }
}

/// Read every event from a log file, skipping lines that fail to parse.
pub fn read_events(path: &Path) -> io::Result<Vec<AcpEvent>> {
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping malformed event at {}:{}: {}", path.display(), n + 1, e),
        }
    }
    Ok(events)
}

/// Most recently modified `.jsonl` file in `dir`.
pub fn latest_log(dir: &Path) -> io::Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let modified = std::fs::metadata(&path)?.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// In-memory log shared between clones.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    events: Arc<Mutex<Vec<AcpEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AcpEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn write(&self, event: &AcpEvent) -> io::Result<()> {
        self.events
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "event log mutex poisoned"))?
            .push(event.clone());
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl EventLogFactory for MemoryEventLog {
    async fn create(&self, _namespace: &str, _task_id: u64, _session_id: &str) -> io::Result<Arc<dyn EventLog>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_jsonl_log_roundtrip() {
        let dir = tempdir().unwrap();
        let factory = JsonlLogFactory::new(dir.path());
        let log = factory.create("org-repo", 3, "sess-a").await.unwrap();

        log.write(&AcpEvent::new(EventType::PromptSent, "sess-a", json!({"text": "hi"})))
            .await
            .unwrap();
        log.write(&AcpEvent::new(EventType::TurnEnd, "sess-a", json!({"stop_reason": "end_turn"})))
            .await
            .unwrap();
        log.close().await.unwrap();

        let path = task_log_dir(dir.path(), "org-repo", 3).join("sess-a.jsonl");
        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["text"], "hi");
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[tokio::test]
    async fn test_session_id_cannot_escape_task_dir() {
        let dir = tempdir().unwrap();
        let factory = JsonlLogFactory::new(dir.path());
        let log = factory.create("org-repo", 3, "../../x").await.unwrap();
        log.close().await.unwrap();

        let task_dir = task_log_dir(dir.path(), "org-repo", 3);
        let written: Vec<_> = std::fs::read_dir(&task_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(written, vec![task_dir.join("_.._x.jsonl")]);
        assert!(!dir.path().join("x.jsonl").exists());
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name("sess-a"), "sess-a.jsonl");
        assert_eq!(log_file_name("a/b\\c"), "a_b_c.jsonl");
        assert_eq!(log_file_name(".."), "session.jsonl");
        assert_eq!(log_file_name(""), "session.jsonl");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = tempdir().unwrap();
        let log = JsonlEventLog::open(dir.path().join("s.jsonl")).await.unwrap();
        log.close().await.unwrap();

        let event = AcpEvent::new(EventType::Plan, "s", json!({}));
        assert!(log.write(&event).await.is_err());
    }

    #[test]
    fn test_read_events_skips_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let good = serde_json::to_string(&AcpEvent::new(EventType::Plan, "s", json!({}))).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n{}\n", good, good)).unwrap();

        assert_eq!(read_events(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_log() {
        let dir = tempdir().unwrap();
        assert_eq!(latest_log(&dir.path().join("missing")).unwrap(), None);

        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("only.jsonl"), "").unwrap();
        assert_eq!(latest_log(dir.path()).unwrap(), Some(dir.path().join("only.jsonl")));
    }
}
