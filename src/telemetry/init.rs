// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup for the `crew` binary.
//!
//! Logs always go to stderr: stdout carries the agent's streamed message text.

use std::io;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How `crew` logs.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level used when neither a filter nor `RUST_LOG` is given.
    pub default_level: Level,

    /// Explicit filter directive, e.g. `crew::acp=debug`. Wins over `RUST_LOG`.
    pub filter_directive: Option<String>,

    /// Source locations and span enter/exit events, for debugging a run.
    pub detailed: bool,

    pub ansi_colors: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            filter_directive: None,
            detailed: false,
            ansi_colors: true,
        }
    }
}

impl TelemetryConfig {
    /// `--verbose` / `--debug`: debug level with source locations.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            detailed: true,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    /// Resolve the filter: explicit directive, then `RUST_LOG`, then the default level.
    ///
    /// An invalid directive falls back to the default level.
    pub fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber. Call once, at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<()> {
    let span_events = if config.detailed {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_file(config.detailed)
        .with_line_number(config.detailed)
        .with_span_events(span_events)
        .compact();

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(fmt_layer)
        .try_init()
        .map_err(|e| io::Error::other(e.to_string()))
}
