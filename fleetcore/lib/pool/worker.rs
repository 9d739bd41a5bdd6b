use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{registry::HealthReport, FleetError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What the pool currently believes about one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Display name of the worker.
    pub name: String,

    /// Base URL of the worker's agent.
    pub address: String,

    /// Whether the worker answers its health checks.
    pub healthy: bool,

    /// Set when the worker rejected our token. A suspect worker gets no placements until an
    /// authenticated call succeeds again.
    pub suspect: bool,

    /// Health checks missed in a row.
    pub consecutive_failures: u32,

    /// Sandboxes on the worker, as of the last check or placement.
    pub vm_count: usize,

    /// Sandboxes the worker accepts.
    pub capacity: usize,

    /// When the worker was last checked.
    pub last_checked: Option<DateTime<Utc>>,

    /// The last error seen from the worker.
    pub last_error: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WorkerStatus {
    /// A worker that has not been checked yet. It is assumed healthy until a check says
    /// otherwise.
    pub fn new(name: impl Into<String>, address: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            healthy: true,
            suspect: false,
            consecutive_failures: 0,
            vm_count: 0,
            capacity,
            last_checked: None,
            last_error: None,
        }
    }

    /// Whether the worker may receive a new sandbox.
    pub fn accepts_placement(&self) -> bool {
        self.healthy && !self.suspect && self.vm_count < self.capacity
    }

    /// Records a successful health check. The worker's own capacity caps the configured one.
    pub fn record_health(&mut self, health: &HealthReport, configured_capacity: usize) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.vm_count = health.vm_count;
        self.capacity = configured_capacity.min(health.capacity);
        self.last_checked = Some(Utc::now());
        self.last_error = None;
    }

    /// Records a missed health check. Returns `true` if this miss took the worker out of
    /// rotation.
    pub fn record_miss(&mut self, error: &FleetError, failure_threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_checked = Some(Utc::now());
        self.last_error = Some(error.to_string());

        let was_healthy = self.healthy;
        if self.consecutive_failures >= failure_threshold {
            self.healthy = false;
        }
        was_healthy && !self.healthy
    }

    /// Takes the worker out of rotation after it rejected our token.
    pub fn mark_suspect(&mut self, error: &FleetError) {
        self.suspect = true;
        self.last_error = Some(error.to_string());
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
