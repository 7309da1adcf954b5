//! In-memory storage backend for testing.

use crate::backend::TableBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Tables = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// An in-memory table backend.
///
/// This backend keeps every table in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Caches that don't need to survive a restart
///
/// # Example
///
/// ```rust
/// use geode_storage::{InMemoryBackend, TableBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("meta", "queue.next_id", b"7").unwrap();
/// assert_eq!(backend.scan("meta").unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<Tables>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites a stored row in place without any validation.
    ///
    /// Used by tests to simulate bit rot in persisted records. Returns
    /// `false` if the row does not exist.
    pub fn tamper<F>(&self, table: &str, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let mut tables = self.tables.write();
        match tables.get_mut(table).and_then(|rows| rows.get_mut(key)) {
            Some(bytes) => {
                f(bytes);
                true
            }
            None => false,
        }
    }

    /// Returns the number of rows across all tables.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }
}

impl TableBackend for InMemoryBackend {
    fn get(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&self, table: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write();
        let removed = tables
            .get_mut(table)
            .map(|rows| rows.remove(key).is_some())
            .unwrap_or(false);
        if tables.get(table).is_some_and(BTreeMap::is_empty) {
            tables.remove(table);
        }
        Ok(removed)
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn tables(&self) -> StorageResult<Vec<String>> {
        Ok(self.tables.read().keys().cloned().collect())
    }

    fn flush(&self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }
}
