//! Error types for instance-relay.
//!
//! Every fallible operation in the crate returns [`RelayError`]. Variants carry a
//! human-readable message plus, where one exists, the underlying OS error as a
//! `#[source]` so host applications can log the full chain.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the instance-relay library.
#[derive(Debug, Error)]
pub enum RelayError {
    // Identity errors
    #[error("Invalid instance identity {identity:?}: {reason}")]
    InvalidIdentity { identity: String, reason: String },

    // Lock errors
    #[error("Failed to create lock at {path}: {message}")]
    LockFailed {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Leader lock released by a process that does not own it")]
    LockNotHeld,

    // Follower-side handoff errors
    #[error("No leader is listening on {endpoint}: {message}")]
    NotListening { endpoint: String, message: String },

    #[error("Timed out after {0:?} connecting to the leader")]
    ConnectTimeout(Duration),

    #[error("Leader closed the channel without acknowledging the message")]
    NoAcknowledgement,

    // Wire errors
    #[error("Malformed packet: {reason}")]
    MalformedPacket { reason: String },

    #[error("Packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    // OS object errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Shared memory {name}: {message}")]
    SharedMemory { name: String, message: String },

    #[error("Signal {name}: {message}")]
    Signal { name: String, message: String },

    #[error("Runtime error: {message}")]
    Runtime { message: String },

    #[error("Invalid controller state: {message}")]
    InvalidState { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for instance-relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RelayError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a malformed-packet error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        RelayError::MalformedPacket {
            reason: reason.into(),
        }
    }

    /// Whether this error means a follower's handoff did not reach the leader.
    ///
    /// Host applications use this to pick an exit code for a follower process;
    /// the leader is never affected by these.
    pub fn is_follower_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::NotListening { .. }
                | RelayError::ConnectTimeout(_)
                | RelayError::NoAcknowledgement
        )
    }
}
