//! Persisted sync queue.
//!
//! The queue holds at most one entry per entity. New mutations coalesce into
//! the existing entry while it has not been transmitted. Once an entry has
//! been sent its payload and identity (`op_id`, baseline version) are frozen,
//! so a replay after a crash or a transient failure is byte-for-byte the same
//! operation. Mutations that arrive after that point are recorded as a
//! follow-up and become a fresh entry when the flight ends.
//!
//! Entries live in the `sync_queue` table keyed by entity key; the op id
//! counter lives in `meta`. Dead letters live in `dead_letters` keyed by
//! zero-padded op id.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use geode_core::EntityRef;
use geode_storage::TableBackend;
use geode_sync_protocol::{DeltaPayload, OperationType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Queue table.
pub const QUEUE_TABLE: &str = "sync_queue";
/// Dead letter table.
pub const DEAD_LETTER_TABLE: &str = "dead_letters";
/// Engine metadata table.
pub const META_TABLE: &str = "meta";

const NEXT_OP_ID_KEY: &str = "queue.next_op_id";

/// One outstanding operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Operation id; also the idempotency id on the wire.
    pub op_id: u64,
    /// Target entity.
    pub entity: EntityRef,
    /// Operation.
    pub operation: OperationType,
    /// Payload computed at enqueue, frozen once transmitted.
    pub delta_payload: DeltaPayload,
    /// Scheduling priority (higher first).
    pub priority: u8,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Earliest time of the next attempt (ms since epoch).
    pub next_retry_at: u64,
    /// Enqueue time (ms since epoch).
    pub created_at: u64,
    /// Entities that must have a remote id before this one is sent.
    pub depends_on: Vec<EntityRef>,
    /// Remote version the payload was computed against.
    pub baseline_version: Option<u64>,
    /// `updated_at` of the entity state the payload describes.
    pub updated_at: u64,
    /// A batch holding this entry is on the wire.
    pub in_flight: bool,
    /// The entry has been sent at least once; payload and identity are frozen.
    pub transmitted: bool,
    /// Mutation recorded while the entry was transmitted.
    pub follow_up: Option<OperationType>,
}

impl QueueEntry {
    fn sort_key(&self) -> (std::cmp::Reverse<u8>, u64, u64) {
        (std::cmp::Reverse(self.priority), self.created_at, self.op_id)
    }
}

/// A mutation to record.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    /// Target entity.
    pub entity: EntityRef,
    /// Operation implied by the mutation.
    pub operation: OperationType,
    /// Payload for the operation as of now.
    pub delta_payload: DeltaPayload,
    /// Priority of the entity type.
    pub priority: u8,
    /// Dependencies extracted from the payload.
    pub depends_on: Vec<EntityRef>,
    /// Entity's current remote version.
    pub baseline_version: Option<u64>,
    /// Entity's current `updated_at`.
    pub updated_at: u64,
}

/// What [`SyncQueue::enqueue`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    Queued(QueueEntry),
    /// The mutation was folded into the existing entry.
    Coalesced(QueueEntry),
    /// The entry is transmitted; the mutation became its follow-up.
    FollowUp(QueueEntry),
    /// A create followed by a delete: the entry was dropped.
    Cancelled(QueueEntry),
}

/// What a failed attempt led to.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Scheduled for another attempt.
    Scheduled {
        /// Attempt count after this failure.
        attempt: u32,
        /// Next attempt time.
        next_retry_at: u64,
    },
    /// Retry budget exhausted; the entry was dead-lettered.
    DeadLettered(DeadLetter),
}

/// An entry that failed terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The failed entry.
    pub entry: QueueEntry,
    /// Why it failed.
    pub reason: String,
    /// True for remote rejections, false for exhausted retries.
    pub permanent: bool,
    /// Failure time (ms since epoch).
    pub failed_at: u64,
}

struct QueueInner {
    entries: BTreeMap<EntityRef, QueueEntry>,
    next_op_id: u64,
}

/// Durable queue of outstanding operations.
pub struct SyncQueue {
    backend: Arc<dyn TableBackend>,
    inner: Mutex<QueueInner>,
    unreadable: Mutex<Vec<EntityRef>>,
}

impl SyncQueue {
    /// Loads the queue from `backend`.
    ///
    /// Entries left in flight by a previous process are released and made
    /// ready immediately, keeping their frozen identity for replay. Rows that
    /// no longer decode are dropped; their entities are reported by
    /// [`SyncQueue::take_unreadable`] so the caller can queue them afresh.
    pub fn open(backend: Arc<dyn TableBackend>, now: u64) -> SyncResult<Self> {
        let mut entries = BTreeMap::new();
        let mut unreadable = Vec::new();
        let mut max_op_id = 0;
        let mut recovered = 0;

        for (key, bytes) in backend.scan(QUEUE_TABLE)? {
            let mut entry: QueueEntry = match decode(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key, error = %e, "dropping unreadable queue entry");
                    backend.delete(QUEUE_TABLE, &key)?;
                    if let Ok(entity) = EntityRef::parse_key(&key) {
                        unreadable.push(entity);
                    }
                    continue;
                }
            };
            max_op_id = max_op_id.max(entry.op_id);
            if entry.in_flight {
                entry.in_flight = false;
                entry.next_retry_at = now;
                backend.put(QUEUE_TABLE, &key, &encode(&entry)?)?;
                recovered += 1;
            }
            entries.insert(entry.entity, entry);
        }
        for (_, bytes) in backend.scan(DEAD_LETTER_TABLE)? {
            if let Ok(letter) = decode::<DeadLetter>(&bytes) {
                max_op_id = max_op_id.max(letter.entry.op_id);
            }
        }

        let stored_next = match backend.get(META_TABLE, NEXT_OP_ID_KEY)? {
            Some(bytes) => decode::<u64>(&bytes).unwrap_or(1),
            None => 1,
        };
        let next_op_id = stored_next.max(max_op_id + 1);

        if recovered > 0 {
            tracing::info!(recovered, "released in-flight entries after restart");
        }
        tracing::debug!(entries = entries.len(), next_op_id, "sync queue opened");

        Ok(Self {
            backend,
            inner: Mutex::new(QueueInner {
                entries,
                next_op_id,
            }),
            unreadable: Mutex::new(unreadable),
        })
    }

    /// Returns the entities whose entries were dropped as unreadable on open.
    pub fn take_unreadable(&self) -> Vec<EntityRef> {
        std::mem::take(&mut *self.unreadable.lock())
    }

    /// Records a mutation, coalescing with any existing entry.
    pub fn enqueue(&self, request: EnqueueRequest, now: u64) -> SyncResult<EnqueueOutcome> {
        let mut inner = self.inner.lock();
        let Some(existing) = inner.entries.get(&request.entity).cloned() else {
            let entry = QueueEntry {
                op_id: self.allocate_op_id(&mut inner)?,
                entity: request.entity,
                operation: request.operation,
                delta_payload: request.delta_payload,
                priority: request.priority,
                attempt: 0,
                next_retry_at: now,
                created_at: now,
                depends_on: request.depends_on,
                baseline_version: request.baseline_version,
                updated_at: request.updated_at,
                in_flight: false,
                transmitted: false,
                follow_up: None,
            };
            self.store_entry(&mut inner, entry.clone())?;
            return Ok(EnqueueOutcome::Queued(entry));
        };

        if existing.transmitted {
            let follow_up = match (existing.operation, existing.follow_up, request.operation) {
                (_, _, OperationType::Delete) => OperationType::Delete,
                (OperationType::Delete, _, _) | (_, Some(OperationType::Delete), _) => {
                    return Err(SyncError::InvalidOperation(format!(
                        "{} has a delete in progress",
                        request.entity
                    )))
                }
                (_, Some(OperationType::Create), _) | (_, _, OperationType::Create) => OperationType::Create,
                _ => OperationType::Update,
            };
            let mut entry = existing;
            entry.follow_up = Some(follow_up);
            self.store_entry(&mut inner, entry.clone())?;
            return Ok(EnqueueOutcome::FollowUp(entry));
        }

        let operation = match (existing.operation, request.operation) {
            (OperationType::Delete, OperationType::Delete) => OperationType::Delete,
            (OperationType::Delete, _) => {
                return Err(SyncError::InvalidOperation(format!("{} is deleted", request.entity)))
            }
            (OperationType::Create, OperationType::Delete) => {
                self.delete_entry(&mut inner, &request.entity)?;
                return Ok(EnqueueOutcome::Cancelled(existing));
            }
            (_, OperationType::Delete) => OperationType::Delete,
            (OperationType::Create, _) | (_, OperationType::Create) => OperationType::Create,
            (OperationType::Update, OperationType::Update) => OperationType::Update,
        };

        let mut entry = existing;
        entry.operation = operation;
        entry.delta_payload = request.delta_payload;
        entry.priority = request.priority;
        entry.depends_on = request.depends_on;
        entry.baseline_version = request.baseline_version;
        entry.updated_at = request.updated_at;
        entry.attempt = 0;
        entry.next_retry_at = now;
        self.store_entry(&mut inner, entry.clone())?;
        Ok(EnqueueOutcome::Coalesced(entry))
    }

    /// Returns the entry for an entity.
    pub fn get(&self, entity: &EntityRef) -> Option<QueueEntry> {
        self.inner.lock().entries.get(entity).cloned()
    }

    /// Returns all entries in scheduling order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<_> = self.inner.lock().entries.values().cloned().collect();
        entries.sort_by_key(QueueEntry::sort_key);
        entries
    }

    /// Returns the number of outstanding entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Replaces an entry.
    pub fn update(&self, entry: QueueEntry) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        self.store_entry(&mut inner, entry)
    }

    /// Removes the entry for an entity.
    pub fn remove(&self, entity: &EntityRef) -> SyncResult<Option<QueueEntry>> {
        let mut inner = self.inner.lock();
        self.delete_entry(&mut inner, entity)
    }

    /// Returns the highest-priority entry that can be sent now.
    ///
    /// An entry is ready when its retry time has come, it is not in flight
    /// and `is_ready` accepts it (dependencies resolved, no pending
    /// conflict). Blocked entries are skipped, not failed.
    pub fn next_ready(&self, now: u64, is_ready: impl Fn(&QueueEntry) -> bool) -> Option<QueueEntry> {
        self.entries()
            .into_iter()
            .find(|e| !e.in_flight && e.next_retry_at <= now && is_ready(e))
    }

    /// Picks up to `limit` ready entries for one batch.
    ///
    /// Entries in `exclude` are skipped, and an entry is never batched with
    /// one of its own dependencies.
    pub fn select_batch(
        &self,
        now: u64,
        limit: usize,
        exclude: &HashSet<u64>,
        is_ready: impl Fn(&QueueEntry) -> bool,
    ) -> Vec<QueueEntry> {
        let mut batch: Vec<QueueEntry> = Vec::new();
        for entry in self.entries() {
            if batch.len() >= limit {
                break;
            }
            if entry.in_flight || entry.next_retry_at > now || exclude.contains(&entry.op_id) {
                continue;
            }
            if entry
                .depends_on
                .iter()
                .any(|dep| batch.iter().any(|b| b.entity == *dep))
            {
                continue;
            }
            if is_ready(&entry) {
                batch.push(entry);
            }
        }
        batch
    }

    /// Marks entries as on the wire and freezes them.
    pub fn mark_in_flight(&self, entries: &[QueueEntry]) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        for sent in entries {
            if let Some(mut entry) = inner.entries.get(&sent.entity).cloned() {
                if entry.op_id == sent.op_id {
                    entry.operation = sent.operation;
                    entry.delta_payload = sent.delta_payload.clone();
                    entry.depends_on = sent.depends_on.clone();
                    entry.baseline_version = sent.baseline_version;
                    entry.updated_at = sent.updated_at;
                    entry.in_flight = true;
                    entry.transmitted = true;
                    self.store_entry(&mut inner, entry)?;
                }
            }
        }
        Ok(())
    }

    /// Finishes an entry after the remote accepted it.
    ///
    /// Returns the recorded follow-up, if any; the caller re-enqueues it from
    /// the entity's current state.
    pub fn complete(&self, entity: &EntityRef, op_id: u64) -> SyncResult<Option<OperationType>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(entity) {
            Some(entry) if entry.op_id == op_id => {
                let follow_up = entry.follow_up;
                self.delete_entry(&mut inner, entity)?;
                Ok(follow_up)
            }
            _ => Ok(None),
        }
    }

    /// Releases an entry after a failed attempt.
    ///
    /// With `count_attempt`, the failure consumes retry budget and the entry
    /// is dead-lettered once the budget is gone.
    pub fn fail_attempt(
        &self,
        entity: &EntityRef,
        op_id: u64,
        reason: &str,
        count_attempt: bool,
        retry: &RetryConfig,
        now: u64,
    ) -> SyncResult<Option<RetryOutcome>> {
        let mut inner = self.inner.lock();
        let Some(mut entry) = inner.entries.get(entity).filter(|e| e.op_id == op_id).cloned() else {
            return Ok(None);
        };
        entry.in_flight = false;
        if count_attempt {
            entry.attempt += 1;
        }
        if retry.is_exhausted(entry.attempt) {
            let letter = self.bury(&mut inner, entry, reason, false, now)?;
            return Ok(Some(RetryOutcome::DeadLettered(letter)));
        }
        entry.next_retry_at = retry.retry_at(now, entry.attempt);
        let outcome = RetryOutcome::Scheduled {
            attempt: entry.attempt,
            next_retry_at: entry.next_retry_at,
        };
        self.store_entry(&mut inner, entry)?;
        Ok(Some(outcome))
    }

    /// Moves an entry to the dead letters after a permanent rejection.
    pub fn reject(&self, entity: &EntityRef, op_id: u64, reason: &str, now: u64) -> SyncResult<Option<DeadLetter>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(entity).filter(|e| e.op_id == op_id).cloned() else {
            return Ok(None);
        };
        let letter = self.bury(&mut inner, entry, reason, true, now)?;
        Ok(Some(letter))
    }

    /// Returns all dead letters, oldest op first.
    pub fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        let mut letters = Vec::new();
        for (key, bytes) in self.backend.scan(DEAD_LETTER_TABLE)? {
            match decode::<DeadLetter>(&bytes) {
                Ok(letter) => letters.push(letter),
                Err(e) => tracing::warn!(key, error = %e, "unreadable dead letter"),
            }
        }
        Ok(letters)
    }

    /// Returns one dead letter.
    pub fn dead_letter(&self, op_id: u64) -> SyncResult<Option<DeadLetter>> {
        match self.backend.get(DEAD_LETTER_TABLE, &dead_letter_key(op_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes and returns a dead letter.
    pub fn take_dead_letter(&self, op_id: u64) -> SyncResult<DeadLetter> {
        let key = dead_letter_key(op_id);
        let bytes = self
            .backend
            .get(DEAD_LETTER_TABLE, &key)?
            .ok_or_else(|| SyncError::NotFound(format!("dead letter {op_id}")))?;
        let letter = decode::<DeadLetter>(&bytes)?;
        self.backend.delete(DEAD_LETTER_TABLE, &key)?;
        Ok(letter)
    }

    /// Puts a dead letter back in the queue as a fresh entry.
    ///
    /// The payload is recomputed by the caller, so the entry gets a new op
    /// id and is no longer frozen.
    pub fn requeue(&self, mut entry: QueueEntry, now: u64) -> SyncResult<QueueEntry> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&entry.entity) {
            return Err(SyncError::InvalidOperation(format!(
                "{} already has a pending operation",
                entry.entity
            )));
        }
        entry.op_id = self.allocate_op_id(&mut inner)?;
        entry.attempt = 0;
        entry.next_retry_at = now;
        entry.in_flight = false;
        entry.transmitted = false;
        self.store_entry(&mut inner, entry.clone())?;
        Ok(entry)
    }

    fn bury(
        &self,
        inner: &mut QueueInner,
        entry: QueueEntry,
        reason: &str,
        permanent: bool,
        now: u64,
    ) -> SyncResult<DeadLetter> {
        let letter = DeadLetter {
            entry,
            reason: reason.to_string(),
            permanent,
            failed_at: now,
        };
        self.backend
            .put(DEAD_LETTER_TABLE, &dead_letter_key(letter.entry.op_id), &encode(&letter)?)?;
        self.delete_entry(inner, &letter.entry.entity)?;
        tracing::warn!(
            entity = %letter.entry.entity,
            op_id = letter.entry.op_id,
            permanent,
            reason,
            "operation dead-lettered"
        );
        Ok(letter)
    }

    fn allocate_op_id(&self, inner: &mut QueueInner) -> SyncResult<u64> {
        let op_id = inner.next_op_id;
        inner.next_op_id += 1;
        self.backend
            .put(META_TABLE, NEXT_OP_ID_KEY, &encode(&inner.next_op_id)?)?;
        Ok(op_id)
    }

    fn store_entry(&self, inner: &mut QueueInner, entry: QueueEntry) -> SyncResult<()> {
        self.backend
            .put(QUEUE_TABLE, &entry.entity.key(), &encode(&entry)?)?;
        inner.entries.insert(entry.entity, entry);
        Ok(())
    }

    fn delete_entry(&self, inner: &mut QueueInner, entity: &EntityRef) -> SyncResult<Option<QueueEntry>> {
        self.backend.delete(QUEUE_TABLE, &entity.key())?;
        Ok(inner.entries.remove(entity))
    }
}

fn dead_letter_key(op_id: u64) -> String {
    format!("{op_id:020}")
}

pub(crate) fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| SyncError::Protocol(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| SyncError::Protocol(e.to_string()))
}
