//! Errors surfaced by tracking server clients.

use thiserror::Error;

/// Convenience alias for tracking operations.
pub type TrackingResult<T> = Result<T, TrackingError>;

/// Errors returned when talking to a tracking server.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// The request never produced a usable response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        message: String,
    },

    /// The server answered but the payload made no sense.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl TrackingError {
    /// True when the server answered with the given status code.
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, TrackingError::Api { status, .. } if *status == code)
    }
}

impl From<reqwest::Error> for TrackingError {
    fn from(err: reqwest::Error) -> Self {
        TrackingError::Transport(err.to_string())
    }
}
