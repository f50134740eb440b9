//! Custom error types for the session core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate, and the
//! narrower `TransportError` that concrete transports return. Using the `thiserror` crate,
//! it gives a single consistent way to report failures, from a missing instrument to a
//! read that timed out in the middle of a measurement run.
//!
//! ## Error Hierarchy
//!
//! - **`ConnectFailed`**: The connect retry budget was exhausted. Carries the number of
//!   attempts and the last underlying cause. The session stays disconnected.
//! - **`Validation`**: The identification probe failed. Only used internally by connect
//!   as the reason for the next attempt; never returned to callers.
//! - **`NotConnected`** / **`AlreadyMeasuring`**: Precondition failures. Returned
//!   immediately, nothing is retried and no state is touched.
//! - **`Read`** / **`ReadTimeout`**: A single measurement cycle failed. The read loop
//!   recovers from these (reconnect, backoff) and reports them as failure events.
//! - **`LoopAborted`**: The consecutive-error budget ran out and the run was ended.
//! - **`Config`** / **`Configuration`** / **`InvalidResource`**: Problems loading or
//!   validating settings.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! keeping the `?` operator usable throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failures reported by a [`Transport`](crate::hardware::Transport) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The per-call I/O timeout elapsed before the operation finished.
    #[error("I/O timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The underlying channel reported an error.
    #[error("I/O error: {0}")]
    Io(String),

    /// The handle was already closed, or the peer closed the channel.
    #[error("transport closed")]
    Closed,

    /// The resource could not be opened.
    #[error("failed to open '{resource}': {reason}")]
    Open {
        /// Resource string that was being opened.
        resource: String,
        /// Driver-provided reason.
        reason: String,
    },
}

impl TransportError {
    /// Whether this failure is a timeout rather than a hard I/O error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(Duration::ZERO),
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => TransportError::Closed,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Connect retry budget exhausted.
    #[error("Failed to connect to '{resource}' after {attempts} attempts. Last error: {last_error}")]
    ConnectFailed {
        /// Resource that was opened.
        resource: String,
        /// Attempts made.
        attempts: u32,
        /// Cause of the final attempt.
        last_error: String,
    },

    /// Identification probe failed; only ever a reason to retry connect.
    #[error("Device validation failed: {0}")]
    Validation(String),

    /// Operation needs a connected session.
    #[error("Not connected to instrument")]
    NotConnected,

    /// A run already holds the session.
    #[error("A measurement run is already active")]
    AlreadyMeasuring,

    /// Reading a response failed.
    #[error("Read failed: {0}")]
    Read(#[from] TransportError),

    /// Sending a command failed.
    #[error("Write failed: {0}")]
    Write(TransportError),

    /// Read still failing after every reconnect.
    #[error("Read operation failed after {attempts} reconnection attempts. Last error: {last_error}")]
    ReadTimeout {
        /// Reconnects made.
        attempts: u32,
        /// Cause of the final attempt.
        last_error: String,
    },

    /// Consecutive-error budget exhausted.
    #[error("Measurement stopped after {consecutive_errors} consecutive errors. Last error: {last_error}")]
    LoopAborted {
        /// Failures in a row.
        consecutive_errors: u32,
        /// Cause of the final failure.
        last_error: String,
    },

    /// Resource string could not be parsed.
    #[error("Invalid resource string '{0}'")]
    InvalidResource(String),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings loaded but are invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker task panicked or was cancelled.
    #[error("Measurement worker failed: {0}")]
    Worker(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether this error is a precondition failure (nothing was attempted).
    pub fn is_precondition(&self) -> bool {
        matches!(self, DaqError::NotConnected | DaqError::AlreadyMeasuring)
    }
}
