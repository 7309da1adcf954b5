//! # Geode Sync Protocol
//!
//! Sync protocol types for the Geode offline cache.
//!
//! This crate provides:
//! - [`SyncOperation`] items carried in a batch to the remote backend
//! - [`BatchRequest`] / [`BatchResponse`] and the per-item [`ItemOutcome`]
//! - The delta computer ([`compute_delta`], [`diff_fields`])
//! - [`ConflictRecord`] and [`ConflictPolicy`] for divergence handling
//! - Three-way field merge ([`merge_fields`])
//! - CBOR encoding/decoding of wire messages
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod delta;
mod error;
mod merge;
mod messages;
mod operation;

pub use conflict::{
    ConflictPolicy, ConflictRecord, ConflictResolution, ConflictSide, ResolutionChoice,
    VersionSnapshot,
};
pub use delta::{compute_delta, diff_fields, DeltaPayload, FieldDelta};
pub use error::{ProtocolError, ProtocolResult};
pub use merge::{merge_fields, MergeOutcome};
pub use messages::{
    BatchRequest, BatchResponse, FetchRequest, FetchResponse, ItemOutcome, ItemResult,
};
pub use operation::{OperationType, SyncOperation};
