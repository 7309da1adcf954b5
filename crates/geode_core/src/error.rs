//! Error types for the local store.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] geode_storage::StorageError),

    /// Payload does not satisfy the entity type's schema.
    #[error("validation failed for {entity_type}: {message}")]
    Validation {
        /// Entity type name.
        entity_type: String,
        /// What is wrong with the payload.
        message: String,
    },

    /// Stored record failed checksum verification or could not be decoded.
    ///
    /// The record has been quarantined and must be refetched.
    #[error("corrupted record {key}: {message}")]
    Corruption {
        /// Storage key of the record.
        key: String,
        /// Description of the corruption.
        message: String,
    },

    /// Eviction could not bring the cache under its budget.
    #[error("storage exhausted: {used_bytes} bytes in use, budget {budget_bytes} ({pinned_or_dirty_bytes} bytes pinned or unsynced)")]
    StorageExhausted {
        /// Bytes in use after eviction.
        used_bytes: u64,
        /// Requested budget.
        budget_bytes: u64,
        /// Bytes held by entries that may not be evicted.
        pinned_or_dirty_bytes: u64,
        /// Entries evicted before giving up.
        evicted: usize,
    },

    /// Invalid static configuration (registry, dependency graph, migrations).
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// Migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// Entity not found.
    #[error("entity not found: {key}")]
    NotFound {
        /// Storage key that was looked up.
        key: String,
    },

    /// Operation not permitted in the entity's current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Record encoding failed.
    #[error("encoding error: {message}")]
    Encoding {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Returns true if the error means the cached copy cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}
