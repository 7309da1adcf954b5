//! Conflict resolution and the conflict log.
//!
//! [`decide`] applies an entity type's policy to a detected divergence.
//! [`ConflictLog`] persists the records: the `conflicts` table holds the
//! latest record per entity, `conflict_audit` keeps every resolved record in
//! order so a losing version is never lost.

use crate::error::{SyncError, SyncResult};
use crate::queue::{decode, encode, META_TABLE};
use geode_core::EntityRef;
use geode_storage::TableBackend;
use geode_sync_protocol::{merge_fields, ConflictPolicy, ConflictRecord, ConflictSide, VersionSnapshot};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Latest conflict record per entity.
pub const CONFLICT_TABLE: &str = "conflicts";
/// Append-only log of resolved records.
pub const AUDIT_TABLE: &str = "conflict_audit";

const AUDIT_SEQ_KEY: &str = "conflicts.audit_seq";

/// Outcome of applying a policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Needs an explicit decision.
    Pending,
    /// Settled automatically.
    Resolved {
        /// Side that won.
        winner: ConflictSide,
        /// Payload to keep; `None` if the winning side is a delete.
        payload: Option<Value>,
    },
}

/// Applies `policy` to a divergence between `local` and `remote`.
///
/// A remote delete always waits for a decision, since accepting it discards
/// local data. Ties in last-write-wins go to the remote side.
pub fn decide(
    policy: ConflictPolicy,
    local: &VersionSnapshot,
    remote: &VersionSnapshot,
    base: Option<&Value>,
) -> Decision {
    let Some(remote_payload) = &remote.payload else {
        return Decision::Pending;
    };
    match policy {
        ConflictPolicy::Manual => Decision::Pending,
        ConflictPolicy::LastWriteWins => last_write_wins(local, remote),
        ConflictPolicy::FieldMerge => {
            let Some(local_payload) = &local.payload else {
                return last_write_wins(local, remote);
            };
            let outcome = merge_fields(base, local_payload, remote_payload, local.updated_at, remote.updated_at);
            let winner = if outcome.merged == *remote_payload {
                ConflictSide::Remote
            } else if outcome.merged == *local_payload {
                ConflictSide::Local
            } else {
                ConflictSide::Merged
            };
            tracing::debug!(
                local_only = outcome.local_only.len(),
                remote_only = outcome.remote_only.len(),
                overlapping = outcome.overlapping.len(),
                ?winner,
                "field merge"
            );
            Decision::Resolved {
                winner,
                payload: Some(outcome.merged),
            }
        }
    }
}

fn last_write_wins(local: &VersionSnapshot, remote: &VersionSnapshot) -> Decision {
    if local.updated_at > remote.updated_at {
        Decision::Resolved {
            winner: ConflictSide::Local,
            payload: local.payload.clone(),
        }
    } else {
        Decision::Resolved {
            winner: ConflictSide::Remote,
            payload: remote.payload.clone(),
        }
    }
}

/// Persistent conflict records.
pub struct ConflictLog {
    backend: Arc<dyn TableBackend>,
    audit_seq: Mutex<u64>,
}

impl ConflictLog {
    /// Opens the log over `backend`.
    pub fn open(backend: Arc<dyn TableBackend>) -> SyncResult<Self> {
        let seq = match backend.get(META_TABLE, AUDIT_SEQ_KEY)? {
            Some(bytes) => decode::<u64>(&bytes)?,
            None => 0,
        };
        Ok(Self {
            backend,
            audit_seq: Mutex::new(seq),
        })
    }

    /// Stores a record, replacing any earlier one for the same entity.
    ///
    /// Resolved records are also appended to the audit log.
    pub fn save(&self, record: &ConflictRecord) -> SyncResult<()> {
        let bytes = record.encode()?;
        self.backend.put(CONFLICT_TABLE, &record.id, &bytes)?;
        if !record.is_pending() {
            let mut seq = self.audit_seq.lock();
            *seq += 1;
            self.backend.put(AUDIT_TABLE, &format!("{:020}", *seq), &bytes)?;
            self.backend
                .put(META_TABLE, AUDIT_SEQ_KEY, &encode(&*seq)?)?;
        }
        Ok(())
    }

    /// Returns the latest record for an entity.
    pub fn get(&self, entity: &EntityRef) -> SyncResult<Option<ConflictRecord>> {
        match self.backend.get(CONFLICT_TABLE, &entity.key())? {
            Some(bytes) => Ok(Some(ConflictRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns the record with the given id.
    pub fn by_id(&self, id: &str) -> SyncResult<ConflictRecord> {
        let bytes = self
            .backend
            .get(CONFLICT_TABLE, id)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {id}")))?;
        Ok(ConflictRecord::decode(&bytes)?)
    }

    /// Returns true if the entity waits on a decision.
    pub fn has_pending(&self, entity: &EntityRef) -> SyncResult<bool> {
        Ok(self.get(entity)?.is_some_and(|r| r.is_pending()))
    }

    /// Returns every record still waiting on a decision.
    pub fn pending(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.all()?.into_iter().filter(ConflictRecord::is_pending).collect())
    }

    /// Returns the latest record of every entity.
    pub fn all(&self) -> SyncResult<Vec<ConflictRecord>> {
        let mut records = Vec::new();
        for (key, bytes) in self.backend.scan(CONFLICT_TABLE)? {
            match ConflictRecord::decode(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key, error = %e, "unreadable conflict record"),
            }
        }
        records.sort_by_key(|r| r.detected_at);
        Ok(records)
    }

    /// Returns the resolved records of one entity, oldest first.
    pub fn history(&self, id: &str) -> SyncResult<Vec<ConflictRecord>> {
        let mut records = Vec::new();
        for (_, bytes) in self.backend.scan(AUDIT_TABLE)? {
            let record = ConflictRecord::decode(&bytes)?;
            if record.id == id {
                records.push(record);
            }
        }
        Ok(records)
    }
}
