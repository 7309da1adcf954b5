//! # Geode Testkit
//!
//! Test utilities for the Geode offline cache.
//!
//! This crate provides:
//! - [`RemoteSimulator`], an in-process remote backend with versioning,
//!   idempotent replay and fault injection, also servable over the loopback
//!   HTTP client as [`LoopbackRemote`]
//! - Fixtures: sample payloads and a [`TestEngine`] wired to the simulator
//! - Property-based generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geode_testkit::prelude::*;
//!
//! #[test]
//! fn session_reaches_remote() {
//!     let t = TestEngine::memory();
//!     let session = t.create(EntityType::FieldSession, sample_session("Ridge")).unwrap();
//!     t.sync_until_idle(4);
//!     assert!(t.remote_id_of(&session).is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
    pub use geode_core::{CachedEntity, ChangeSource, EntityRegistry, EntityType, LocalId};
    pub use geode_sync_engine::{RetryConfig, SyncConfig, SyncError, SyncState};
    pub use geode_sync_protocol::{ConflictPolicy, ConflictSide, ResolutionChoice};
}

pub use fixtures::*;
pub use generators::*;
pub use remote::*;
