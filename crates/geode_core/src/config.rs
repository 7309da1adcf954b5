//! Store configuration.

/// Configuration for a [`LocalStore`](crate::LocalStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Size the cache is brought back under by
    /// [`enforce_budget`](crate::LocalStore::enforce_budget).
    pub storage_budget_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_budget_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the storage budget.
    #[must_use]
    pub const fn with_storage_budget(mut self, bytes: u64) -> Self {
        self.storage_budget_bytes = bytes;
        self
    }
}
