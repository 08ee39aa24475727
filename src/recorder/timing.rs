//! Start/stop timing of named operations within one logical chain.
//!
//! A timer is owned by a single chain (`&mut self` everywhere), so two
//! concurrent chains can never observe each other's pending operations.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Tracks in-flight operations by id.
#[derive(Debug, Default)]
pub struct OperationTimer {
    started: HashMap<String, Instant>,
    completed: u64,
}

impl OperationTimer {
    /// Create an empty timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing `operation_id`.
    ///
    /// Returns `false` when the id was already running; its start is reset.
    pub fn start(&mut self, operation_id: impl Into<String>) -> bool {
        let operation_id = operation_id.into();
        let restarted = self.started.insert(operation_id.clone(), Instant::now()).is_some();
        if restarted {
            debug!(%operation_id, "operation restarted before it was stopped");
        }
        !restarted
    }

    /// Stop timing `operation_id` and return its elapsed time.
    ///
    /// Returns `None` for an id that was never started or already stopped.
    pub fn stop(&mut self, operation_id: &str) -> Option<Duration> {
        let started = self.started.remove(operation_id)?;
        let elapsed = Instant::now().saturating_duration_since(started);
        self.completed += 1;
        info!(
            operation_id,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "operation completed"
        );
        Some(elapsed)
    }

    /// Number of operations started and not yet stopped.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.started.len()
    }

    /// Number of operations stopped so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed
    }
}
