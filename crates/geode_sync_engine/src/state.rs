//! Sync engine state and statistics.

use geode_core::{EntityRef, EvictionReport};
use std::time::Duration;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is offline; mutations queue up locally.
    Offline,
    /// A sync cycle is running.
    Syncing,
    /// Engine has completed a sync cycle.
    Synced,
    /// The last cycle failed.
    Error,
}

impl SyncState {
    /// Returns true if a sync cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of batch items sent.
    pub items_sent: u64,
    /// Total number of items the remote accepted.
    pub items_accepted: u64,
    /// Total number of conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts settled by policy without user input.
    pub conflicts_auto_resolved: u64,
    /// Items the remote rejected permanently.
    pub rejected: u64,
    /// Failed attempts that were rescheduled.
    pub retries: u64,
    /// Entries moved to the dead letters.
    pub dead_lettered: u64,
    /// Quarantined entries repaired from the remote.
    pub repaired: u64,
    /// Completion time of the last successful cycle (ms since epoch).
    pub last_sync_at: Option<u64>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// An operation the remote refused.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedItem {
    /// Target entity.
    pub entity: EntityRef,
    /// Operation id of the dead letter.
    pub op_id: u64,
    /// Reason given by the remote.
    pub reason: String,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleReport {
    /// Batches sent.
    pub batches: u32,
    /// Items sent.
    pub sent: u64,
    /// Items accepted.
    pub accepted: u64,
    /// Entities that still wait on a manual conflict decision.
    pub pending_conflicts: Vec<EntityRef>,
    /// Conflicts settled by policy.
    pub auto_resolved: u64,
    /// Items rejected by the remote.
    pub rejected: Vec<RejectedItem>,
    /// Entries dead-lettered after exhausting their retries.
    pub exhausted: Vec<EntityRef>,
    /// Items rescheduled after a failure.
    pub retried: u64,
    /// Quarantined entries repaired.
    pub repaired: u64,
    /// Eviction pass run at the end of the cycle.
    pub eviction: Option<EvictionReport>,
    /// Entries still queued when the cycle ended.
    pub remaining: usize,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

impl SyncCycleReport {
    /// Returns true if every sent item was accepted.
    pub fn is_clean(&self) -> bool {
        self.pending_conflicts.is_empty()
            && self.rejected.is_empty()
            && self.exhausted.is_empty()
            && self.retried == 0
    }
}
