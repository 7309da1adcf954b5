//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A table log could not be parsed.
    #[error("table '{table}' corrupted: {message}")]
    Corrupted {
        /// Table whose log is damaged.
        table: String,
        /// Description of the damage.
        message: String,
    },

    /// The table name cannot be used as a file name.
    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    /// Another process holds the storage directory lock.
    #[error("storage directory locked by another process")]
    Locked,
}

impl StorageError {
    /// Creates a corrupted-table error.
    pub fn corrupted(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            table: table.into(),
            message: message.into(),
        }
    }
}
