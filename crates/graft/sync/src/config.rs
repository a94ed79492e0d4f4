//! Per-stage tuning knobs.

use std::time::Duration;

use graft_reconcile::{ManagerConfig, ReconcileError};
use serde::{Deserialize, Serialize};

/// Settings for one pipeline stage.
///
/// Every stage carries its own copy, so a deployment can for example scan
/// experiments rarely but sweep metrics of live runs often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether the stage runs at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between resync scans.
    #[serde(default = "default_resync_frequency_secs")]
    pub resync_frequency_secs: u64,
    /// Worker tasks draining the stage's queue.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Largest batch a worker takes in one pop.
    #[serde(default = "default_run_max_items")]
    pub run_max_items: usize,
    /// Upper bound on entities considered per resync scan.
    #[serde(default = "default_resync_max_items")]
    pub resync_max_items: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_resync_frequency_secs() -> u64 {
    15
}

fn default_max_workers() -> usize {
    1
}

fn default_run_max_items() -> usize {
    1
}

fn default_resync_max_items() -> usize {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enabled: default_enabled(),
            resync_frequency_secs: default_resync_frequency_secs(),
            max_workers: default_max_workers(),
            run_max_items: default_run_max_items(),
            resync_max_items: default_resync_max_items(),
        }
    }
}

impl SyncConfig {
    /// The manager settings this stage runs under.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            resync_frequency: Duration::from_secs(self.resync_frequency_secs),
            max_workers: self.max_workers,
            run_max_items: self.run_max_items,
        }
    }

    /// Rejects settings the stage cannot run with.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        self.manager_config().validate()?;
        if self.resync_max_items < 1 {
            return Err(ReconcileError::InvalidResyncMaxItems(self.resync_max_items));
        }
        Ok(())
    }
}
