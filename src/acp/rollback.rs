// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Compensating actions for multi-step setup.
//!
//! Each step that creates something pushes the action that undoes it. On a
//! later failure the actions run newest first; once setup is past the point
//! of no return the list is disarmed.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

type LocalBoxFuture = Pin<Box<dyn Future<Output = Result<(), String>>>>;

struct Step {
    name: String,
    undo: Box<dyn FnOnce() -> LocalBoxFuture>,
}

/// Ordered list of undo actions.
#[derive(Default)]
pub struct Compensations {
    steps: Vec<Step>,
}

impl Compensations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the undo action for a step that just succeeded.
    pub fn push<F, Fut, E>(&mut self, name: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Display,
    {
        self.steps.push(Step {
            name: name.into(),
            undo: Box::new(move || Box::pin(async move { undo().await.map_err(|e| e.to_string()) })),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every undo action, newest first.
    ///
    /// All actions run even if some fail. Returns the failures as
    /// `"<step>: <error>"` strings.
    pub async fn unwind(self) -> Vec<String> {
        let mut failures = Vec::new();
        for step in self.steps.into_iter().rev() {
            debug!(step = %step.name, "Rolling back");
            if let Err(e) = (step.undo)().await {
                warn!(step = %step.name, "Rollback step failed: {}", e);
                failures.push(format!("{}: {}", step.name, e));
            }
        }
        failures
    }

    /// Commit: drop every undo action without running it.
    pub fn disarm(self) {
        debug!(steps = self.steps.len(), "Compensations disarmed");
    }
}
