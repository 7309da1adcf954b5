//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (message could not be encoded or decoded).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote failed to process the request (5xx).
    #[error("server error: {0}")]
    ServerError(String),

    /// The remote did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// The engine is offline or the transport is down.
    #[error("not connected to server")]
    NotConnected,

    /// The remote permanently refused an operation.
    #[error("operation on {entity} rejected: {reason}")]
    Rejected {
        /// Entity key.
        entity: String,
        /// Reason given by the remote.
        reason: String,
    },

    /// A conflict is waiting for a manual decision.
    #[error("unresolved conflict on {entity}")]
    ConflictDetected {
        /// Entity key.
        entity: String,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Core(#[from] geode_core::CoreError),

    /// Storage backend error on queue or conflict tables.
    #[error("storage error: {0}")]
    Storage(#[from] geode_storage::StorageError),

    /// A queue entry, dead letter or conflict was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}

impl From<geode_sync_protocol::ProtocolError> for SyncError {
    fn from(err: geode_sync_protocol::ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
