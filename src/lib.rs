// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crew - run coding agents against tasks, one git worktree each.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`acp`] - Agent Client Protocol session runtime (orchestrator, control channel, event logs)
//! - [`config`] - Configuration loading, merging and command templating
//! - [`error`] - Error types and result aliases
//! - [`namespace`] - Repository namespace derivation
//! - [`store`] - SQLite database shared by tasks and execution substates
//! - [`task`] - Task records and their repository
//! - [`telemetry`] - Tracing subscriber setup
//! - [`worktree`] - Git worktree management and setup hooks
//!
//! # Example
//!
//! ```rust,ignore
//! use crew::acp::{ExecuteRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(deps);
//! let session_id = orchestrator.execute(&cancel, ExecuteRequest::new(7)).await?;
//! ```

pub mod acp;
pub mod config;
pub mod error;
pub mod namespace;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod worktree;

// Re-export commonly used types at crate root
pub use error::{ConfigError, Result, StoreError};
pub use task::{Task, TaskRepository, TaskStatus};

/// Crew version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
