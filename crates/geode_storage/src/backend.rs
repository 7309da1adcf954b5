//! Storage backend trait definition.

use crate::error::StorageResult;

/// A keyed table store for the Geode cache.
///
/// Backends are **opaque byte stores**. Rows live in named tables and are
/// addressed by string keys; `geode_core` owns the meaning of every row.
///
/// # Invariants
///
/// - `get` returns exactly the bytes of the last `put` for that key
/// - `scan` yields rows in ascending key order
/// - `flush` makes all previous writes durable (no-op for memory backends)
/// - Backends must be `Send + Sync`; all methods take `&self` and lock
///   internally
pub trait TableBackend: Send + Sync {
    /// Reads a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Inserts or replaces a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, table: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes a row.
    ///
    /// Returns `true` if the row existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete(&self, table: &str, key: &str) -> StorageResult<bool>;

    /// Returns every row of a table in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Returns the names of all non-empty tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn tables(&self) -> StorageResult<Vec<String>>;

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;
}
