//! # Geode Sync Engine
//!
//! Sync queue, scheduler and conflict resolution for the Geode offline cache.
//!
//! This crate provides:
//! - A persisted, coalescing [`SyncQueue`] with retry back-off and dead letters
//! - The [`SyncEngine`]: local mutations, sync cycles, remote changes
//! - Conflict policies and a persisted [`ConflictLog`]
//! - Transport abstraction with an HTTP implementation
//!
//! ## Architecture
//!
//! Every local mutation writes the store and enqueues under the entity's key
//! lock, so the queue always reflects the newest local state. A sync cycle:
//! 1. Refetches quarantined records
//! 2. Picks ready entries by priority, then age, holding back any entry whose
//!    parent has no remote id yet
//! 3. Sends them in batches and routes each per-item result
//!
//! ## Key Invariants
//!
//! - At most one pending entry per entity
//! - An entry is never sent before its parents are confirmed
//! - Replays of a sent entry carry its original operation id
//! - A conflict never silently discards either version
//! - Local data is never dropped on a transport failure

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod http;
mod queue;
mod resolver;
mod state;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use engine::{RemoteApplied, RemoteChange, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use http::{CborDecode, CborEncode, HttpClient, HttpFailure, HttpTransport, LoopbackClient, LoopbackServer, DEFAULT_TIMEOUT};
pub use queue::{
    DeadLetter, EnqueueOutcome, EnqueueRequest, QueueEntry, RetryOutcome, SyncQueue, DEAD_LETTER_TABLE, META_TABLE,
    QUEUE_TABLE,
};
pub use resolver::{decide, ConflictLog, Decision, AUDIT_TABLE, CONFLICT_TABLE};
pub use state::{RejectedItem, SyncCycleReport, SyncState, SyncStats};
pub use transport::{MockTransport, SyncTransport};
