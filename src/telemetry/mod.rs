// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing infrastructure.
//!
//! Initialize once at application startup:
//!
//! ```rust,ignore
//! use crew::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Library code logs through the `tracing` macros with structured fields
//! (`task_id = %id`, `session_id = %sid`) and never prints to stdout except for
//! streamed agent output.

mod init;

pub use init::{init_telemetry, TelemetryConfig};
