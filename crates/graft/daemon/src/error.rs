//! Daemon-level errors.

use thiserror::Error;

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Fatal startup and shutdown failures.
///
/// Anything recoverable stays inside the reconcilers; reaching this type
/// means the process cannot usefully continue.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be loaded or does not describe a runnable
    /// deployment.
    #[error("configuration error: {0}")]
    Config(String),

    /// The mirror database could not be opened or prepared.
    #[error("storage error: {0}")]
    Storage(String),

    /// A tracking client could not be constructed.
    #[error("tracking error: {0}")]
    Tracking(String),

    /// The reconciler set failed to come up.
    #[error("sync error: {0}")]
    Sync(String),
}
