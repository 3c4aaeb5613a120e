//! Error telemetry.
//!
//! Failures that must be visible to operators but must not reach the webhook
//! caller are reported here: an `error!` event with structured fields, plus a
//! process-wide counter surfaced on `/health`.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::error;

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    reported: Arc<AtomicU64>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error that occurred during `stage` of a run.
    pub fn report(
        &self,
        stage: &str,
        error_kind: &str,
        pr_number: Option<u64>,
        error: &dyn Display,
    ) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        match pr_number {
            Some(pr_number) => error!(
                stage,
                error_kind,
                pr_number,
                "Reported error: {}",
                error
            ),
            None => error!(stage, error_kind, "Reported error: {}", error),
        }
    }

    pub fn reported_errors(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}
