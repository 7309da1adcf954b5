//! # Geode Storage
//!
//! Keyed table storage backends for the Geode offline cache.
//!
//! This crate provides the lowest-level persistence abstraction. Backends are
//! **opaque byte stores** organised as named tables of `key → bytes` rows.
//! They do not interpret the rows they hold; envelopes, checksums and
//! schemas belong to `geode_core`.
//!
//! ## Design Principles
//!
//! - Tables are flat, ordered maps of string keys to byte values
//! - No knowledge of entities, sync queues or conflict records
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral caches
//! - [`FileBackend`] - Append-only table logs that survive process restarts
//!
//! ## Example
//!
//! ```rust
//! use geode_storage::{InMemoryBackend, TableBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.put("sync_queue", "specimen:1", b"entry").unwrap();
//! assert_eq!(backend.get("sync_queue", "specimen:1").unwrap(), Some(b"entry".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::TableBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
