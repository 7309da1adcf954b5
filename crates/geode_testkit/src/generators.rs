//! Property-based test generators using proptest.
//!
//! Payload strategies always produce values the standard registry accepts.

use proptest::prelude::*;
use serde_json::{json, Value};

/// Minerals commonly logged in the field.
pub const MINERALS: [&str; 8] = [
    "quartz", "agate", "jasper", "obsidian", "calcite", "fluorite", "garnet", "opal",
];

/// Strategy for mineral names.
pub fn mineral_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(MINERALS.to_vec()).prop_map(String::from)
}

/// Strategy for free-text notes.
pub fn notes_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z ]{0,40}").expect("Invalid regex")
}

/// Strategy for field session payloads.
pub fn session_payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[A-Z][a-z]{2,12}( [A-Z][a-z]{2,12})?").expect("Invalid regex"),
        1_600_000_000_000u64..1_800_000_000_000u64,
        prop::option::of(notes_strategy()),
    )
        .prop_map(|(name, started_at, notes)| {
            let mut payload = json!({"name": name, "started_at": started_at});
            if let Some(notes) = notes {
                payload["notes"] = json!(notes);
            }
            payload
        })
}

/// Strategy for specimen fields other than the parent reference.
pub fn specimen_fields_strategy() -> impl Strategy<Value = Value> {
    (
        mineral_strategy(),
        prop::option::of(0.1f64..5000.0),
        prop::collection::vec(prop::string::string_regex("[a-z]{3,8}").expect("Invalid regex"), 0..4),
    )
        .prop_map(|(mineral, weight, tags)| {
            let mut payload = json!({"mineral": mineral, "tags": tags});
            if let Some(weight) = weight {
                payload["weight_g"] = json!(weight);
            }
            payload
        })
}

/// One step of a randomized cache workload.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// Create a session with the given notes.
    Create(String),
    /// Edit the notes of the n-th live session (modulo the count).
    Edit(usize, String),
    /// Delete the n-th live session (modulo the count).
    Delete(usize),
    /// Pin the n-th live session (modulo the count).
    Pin(usize),
    /// Run a sync cycle.
    Sync,
    /// Drop connectivity for the next syncs, or restore it.
    Connectivity(bool),
    /// Run eviction down to the given budget.
    Evict(u64),
}

/// Strategy for single workload steps.
pub fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => notes_strategy().prop_map(CacheOp::Create),
        3 => (any::<usize>(), notes_strategy()).prop_map(|(i, n)| CacheOp::Edit(i, n)),
        1 => any::<usize>().prop_map(CacheOp::Delete),
        1 => any::<usize>().prop_map(CacheOp::Pin),
        2 => Just(CacheOp::Sync),
        1 => any::<bool>().prop_map(CacheOp::Connectivity),
        2 => (0u64..2048).prop_map(CacheOp::Evict),
    ]
}

/// Strategy for workloads of up to `max_len` steps.
pub fn cache_workload_strategy(max_len: usize) -> impl Strategy<Value = Vec<CacheOp>> {
    prop::collection::vec(cache_op_strategy(), 1..max_len.max(2))
}
