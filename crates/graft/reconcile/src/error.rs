use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Engine-level errors. All of these are fatal at startup; nothing here is
/// produced while a manager is running.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("resync frequency must be at least 1ms, got {0:?}")]
    InvalidResyncFrequency(Duration),

    #[error("max workers must be at least 1, got {0}")]
    InvalidMaxWorkers(usize),

    #[error("run max items must be at least 1, got {0}")]
    InvalidRunMaxItems(usize),

    #[error("resync max items must be at least 1, got {0}")]
    InvalidResyncMaxItems(usize),

    #[error("reboot of reconciler '{name}' failed: {reason}")]
    RebootFailed { name: String, reason: String },
}
