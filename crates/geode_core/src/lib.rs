//! # Geode Core
//!
//! Local entity store for the Geode offline cache.
//!
//! This crate provides:
//! - The entity model ([`EntityType`], [`LocalId`], [`CachedEntity`])
//! - Per-entry [`StorageMetadata`] with SHA-256 payload checksums
//! - Payload schemas, migrations and the [`EntityRegistry`]
//! - The [`DependencyGraph`] between entity types
//! - [`LocalStore`]: checksummed reads, per-key locking, eviction
//! - A typed [`ChangeFeed`]
//!
//! Sync scheduling, conflict handling and transport live in
//! `geode_sync_engine`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod clock;
mod config;
mod entity;
mod error;
mod graph;
mod lock;
mod metadata;
mod migration;
mod registry;
mod schema;
mod store;

pub use change_feed::{ChangeFeed, ChangeNotification, ChangeSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use entity::{CachedEntity, EntityRef, EntityType, LocalId};
pub use error::{CoreError, CoreResult};
pub use graph::{Dependency, DependencyEdge, DependencyGraph};
pub use lock::{KeyGuard, KeyLocks};
pub use metadata::{payload_checksum, StorageMetadata, CHECKSUM_LEN};
pub use migration::{MigrationInfo, MigrationKind, MigrationStep, MigrationTable, SchemaVersion, TransformFn};
pub use registry::{EntityRegistry, EntityTypeConfig, RegistryBuilder};
pub use schema::{EntitySchema, FieldKind, FieldSpec};
pub use store::{
    DeleteOutcome, EntryLock, EvictionReport, LocalStore, MigrationReport, QuarantineEntry, LOCAL_INDEX_TABLE,
    QUARANTINE_TABLE, REMOTE_INDEX_TABLE,
};
