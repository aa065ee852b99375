// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hook script runner.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use super::WorktreeError;

/// Run a shell snippet with `sh -c` in `cwd`.
///
/// Stdout is discarded; on a non-zero exit the captured stderr becomes the
/// error message.
pub async fn run_script(
    script: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(), WorktreeError> {
    debug!(cwd = %cwd.display(), "Running hook script");

    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(status = %output.status, "Hook script failed: {}", stderr);
    Err(WorktreeError::ScriptFailed {
        status: output.status.to_string(),
        stderr,
    })
}
