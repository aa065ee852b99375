// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unix domain socket helpers for the control channel.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::net::{UnixListener, UnixStream};

/// Socket path for a (namespace, task) pair.
///
/// The name is a hash so that long namespaces never exceed the platform's
/// socket path limit.
pub fn socket_path(ipc_dir: &Path, namespace: &str, task_id: u64) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}/{}", namespace, task_id).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    ipc_dir.join(format!("{}.sock", &digest[..16]))
}

/// Bind a listener, replacing a stale socket file.
pub async fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path)
}

pub async fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path).await
}

/// Whether something is accepting connections on `path`.
pub async fn is_live(path: &Path) -> bool {
    path.exists() && UnixStream::connect(path).await.is_ok()
}

pub fn cleanup(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}
