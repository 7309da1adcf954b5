//! The sync engine.
//!
//! [`SyncEngine`] owns the local store, the persisted queue and the conflict
//! log. Local mutations write the store and enqueue under the entity's key
//! lock. [`SyncEngine::sync_cycle`] drains the queue in priority order,
//! respecting dependencies, and routes each per-item result: accepted items
//! are marked synced, conflicts go through the entity type's policy, transient
//! failures back off and permanent rejections become dead letters.
//!
//! Lock order is always key lock, then queue lock. No key lock is held while
//! a batch or a refetch is on the wire.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::{DeadLetter, EnqueueOutcome, EnqueueRequest, QueueEntry, RetryOutcome, SyncQueue};
use crate::resolver::{decide, ConflictLog, Decision};
use crate::state::{RejectedItem, SyncCycleReport, SyncState, SyncStats};
use crate::transport::SyncTransport;
use geode_core::{
    CachedEntity, ChangeNotification, ChangeSource, Clock, CoreError, DeleteOutcome, EntityRef, EntityRegistry,
    EntityType, EntryLock, EvictionReport, LocalId, LocalStore, MigrationReport, StorageMetadata,
};
use geode_storage::TableBackend;
use geode_sync_protocol::{
    compute_delta, BatchRequest, BatchResponse, ConflictRecord, ConflictResolution, ConflictSide, DeltaPayload,
    FetchRequest, ItemOutcome, OperationType, ResolutionChoice, SyncOperation, VersionSnapshot,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;

/// A change pushed by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Entity type.
    pub entity_type: EntityType,
    /// Remote id.
    pub remote_id: String,
    /// New remote version.
    pub version: u64,
    /// New payload; `None` if the remote deleted the entity.
    pub payload: Option<Value>,
    /// Remote modification time (ms since epoch).
    pub updated_at: u64,
}

/// What [`SyncEngine::apply_remote_change`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteApplied {
    /// A new entity was cached.
    Inserted(LocalId),
    /// A clean entity took the remote value.
    Overwritten(LocalId),
    /// The entity was removed.
    Removed(LocalId),
    /// Local and remote already agreed.
    Converged(LocalId),
    /// The change is not newer than the cached version.
    Stale,
    /// A delete for an entity that is not cached.
    Ignored,
    /// The entity had local changes; a decision is needed.
    ConflictPending(LocalId),
    /// The entity had local changes; the policy settled it.
    ConflictResolved {
        /// Local id.
        local_id: LocalId,
        /// Side that won.
        winner: ConflictSide,
    },
}

enum Settlement {
    Converged,
    Pending,
    Resolved(ConflictSide),
}

struct Incoming {
    remote_id: Option<String>,
    version: u64,
    payload: Option<Value>,
    updated_at: u64,
}

/// The sync engine manages the local cache and its synchronization with the
/// remote backend.
pub struct SyncEngine<T: SyncTransport> {
    config: SyncConfig,
    store: LocalStore,
    queue: SyncQueue,
    conflicts: ConflictLog,
    transport: Arc<T>,
    online: AtomicBool,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cycle: Mutex<()>,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Opens the engine over `backend`.
    ///
    /// Queue entries left in flight by a previous process are released for
    /// replay with their original identity. Entities whose entry could not be
    /// read back are queued again from their current state.
    pub fn open(
        config: SyncConfig,
        backend: Arc<dyn TableBackend>,
        registry: Arc<EntityRegistry>,
        clock: Arc<dyn Clock>,
        transport: Arc<T>,
    ) -> SyncResult<Self> {
        let queue = SyncQueue::open(backend.clone(), clock.now_ms())?;
        let conflicts = ConflictLog::open(backend.clone())?;
        let store = LocalStore::new(backend, registry, clock, config.store.clone());
        let engine = Self {
            config,
            store,
            queue,
            conflicts,
            transport,
            online: AtomicBool::new(true),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle: Mutex::new(()),
        };
        for key in engine.queue.take_unreadable() {
            let lock = engine.store.lock(key);
            if let Some(entity) = engine.read_for_sync(&lock)? {
                engine.reconcile(&lock, &entity)?;
                tracing::info!(entity = %key, dirty = entity.is_dirty(), "queue entry rebuilt");
            }
        }
        tracing::info!(pending = engine.queue.len(), "sync engine opened");
        Ok(engine)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the local store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true unless the engine was put offline.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records connectivity. While offline, mutations queue up and
    /// [`sync_cycle`](Self::sync_cycle) refuses to start.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            tracing::info!(online, "connectivity changed");
        }
        let mut state = self.state.write();
        if !online {
            *state = SyncState::Offline;
        } else if *state == SyncState::Offline {
            *state = SyncState::Idle;
        }
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Creates an entity locally and queues it for sync.
    pub fn create(&self, entity_type: EntityType, payload: Value) -> SyncResult<CachedEntity> {
        let entry = self.store.lock(EntityRef::new(entity_type, LocalId::new()));
        let entity = entry.put(payload)?;
        self.reconcile(&entry, &entity)?;
        Ok(entity)
    }

    /// Replaces an entity's payload locally and queues the change.
    pub fn update(&self, entity_type: EntityType, local_id: LocalId, payload: Value) -> SyncResult<CachedEntity> {
        let entry = self.store.lock(EntityRef::new(entity_type, local_id));
        if entry.get()?.is_none() {
            return Err(SyncError::NotFound(entry.entity_ref().key()));
        }
        let entity = entry.put(payload)?;
        self.reconcile(&entry, &entity)?;
        Ok(entity)
    }

    /// Deletes an entity locally.
    ///
    /// An entity the remote has never seen is removed and its pending entry
    /// cancelled. Otherwise it becomes a tombstone and a delete is queued.
    ///
    /// Removing an unsynced entity fails with `InvalidOperation` while queued
    /// children still wait for its remote id.
    pub fn delete(&self, entity_type: EntityType, local_id: LocalId) -> SyncResult<DeleteOutcome> {
        let entry = self.store.lock(EntityRef::new(entity_type, local_id));
        let key = entry.entity_ref();
        let entity = entry.get()?.ok_or_else(|| SyncError::NotFound(key.key()))?;
        let transmitted = self.queue.get(&key).is_some_and(|e| e.transmitted);
        if entity.remote_id.is_none() && !transmitted {
            let waiting = self
                .queue
                .entries()
                .into_iter()
                .filter(|e| !e.transmitted && e.depends_on.contains(&key))
                .count();
            if waiting > 0 {
                return Err(SyncError::InvalidOperation(format!(
                    "{key} has {waiting} unsynced dependent(s); delete them first"
                )));
            }
            self.queue.remove(&key)?;
            entry.remove(Some(ChangeSource::Local))?;
            tracing::debug!(entity = %key, "unsynced entity removed, pending entry cancelled");
            return Ok(DeleteOutcome::Removed);
        }
        let entity = entry.tombstone()?;
        self.reconcile(&entry, &entity)?;
        Ok(DeleteOutcome::Tombstoned)
    }

    /// Reads a live entity.
    pub fn get(&self, entity_type: EntityType, local_id: LocalId) -> SyncResult<Option<CachedEntity>> {
        Ok(self.store.get(entity_type, local_id)?)
    }

    /// Lists live entities of a type.
    pub fn list(&self, entity_type: EntityType) -> SyncResult<Vec<CachedEntity>> {
        Ok(self.store.list(entity_type)?)
    }

    /// Pins an entity so eviction never drops it.
    pub fn pin(&self, entity_type: EntityType, local_id: LocalId) -> SyncResult<()> {
        Ok(self.store.pin(entity_type, local_id)?)
    }

    /// Removes a pin.
    pub fn unpin(&self, entity_type: EntityType, local_id: LocalId) -> SyncResult<()> {
        Ok(self.store.unpin(entity_type, local_id)?)
    }

    /// Subscribes to change notifications, optionally from one source only.
    pub fn subscribe(&self, source: Option<ChangeSource>) -> Receiver<ChangeNotification> {
        self.store.feed().subscribe(source)
    }

    // ------------------------------------------------------------------
    // Queue and status
    // ------------------------------------------------------------------

    /// Returns the number of outstanding queue entries.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Returns the outstanding entries in scheduling order.
    pub fn pending_entries(&self) -> Vec<QueueEntry> {
        self.queue.entries()
    }

    /// Returns the entry the scheduler would send next, if any is ready.
    pub fn next_ready(&self) -> Option<QueueEntry> {
        self.queue.next_ready(self.now(), |e| self.is_sendable(e))
    }

    /// Returns conflicts waiting on a decision.
    pub fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.conflicts.pending()
    }

    /// Returns the latest conflict record with the given id.
    pub fn conflict(&self, id: &str) -> SyncResult<ConflictRecord> {
        self.conflicts.by_id(id)
    }

    /// Returns the resolved records of one entity, oldest first.
    pub fn conflict_history(&self, id: &str) -> SyncResult<Vec<ConflictRecord>> {
        self.conflicts.history(id)
    }

    /// Returns the dead letters.
    pub fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        self.queue.dead_letters()
    }

    /// Puts a dead letter back in the queue.
    ///
    /// The payload is recomputed from the entity's current state. Returns
    /// false if the entity has nothing left to sync.
    pub fn retry_dead_letter(&self, op_id: u64) -> SyncResult<bool> {
        let letter = self
            .queue
            .dead_letter(op_id)?
            .ok_or_else(|| SyncError::NotFound(format!("dead letter {op_id}")))?;
        let key = letter.entry.entity;
        let entry = self.store.lock(key);
        if self.queue.get(&key).is_some() {
            return Err(SyncError::InvalidOperation(format!(
                "{key} already has a pending operation"
            )));
        }
        let letter = self.queue.take_dead_letter(op_id)?;
        match self.read_for_sync(&entry)? {
            Some(entity) if entity.is_dirty() => {
                let requeued = self.queue.requeue(letter.entry, self.now())?;
                tracing::info!(entity = %key, op_id = requeued.op_id, "dead letter requeued");
                Ok(true)
            }
            _ => {
                tracing::info!(entity = %key, "dead letter dropped, nothing left to sync");
                Ok(false)
            }
        }
    }

    /// Drops a dead letter. The entity keeps its local state.
    pub fn discard_dead_letter(&self, op_id: u64) -> SyncResult<DeadLetter> {
        self.queue.take_dead_letter(op_id)
    }

    // ------------------------------------------------------------------
    // Cache maintenance
    // ------------------------------------------------------------------

    /// Evicts clean, unpinned entries until the cache fits `budget_bytes`.
    pub fn run_eviction(&self, budget_bytes: u64) -> SyncResult<EvictionReport> {
        Ok(self.store.run_eviction(budget_bytes)?)
    }

    /// Removes clean, unpinned entries whose TTL has elapsed.
    pub fn purge_expired(&self) -> SyncResult<usize> {
        Ok(self.store.purge_expired()?)
    }

    /// Upgrades every record written under an older schema.
    pub fn migrate_all(&self) -> SyncResult<MigrationReport> {
        Ok(self.store.migrate_all()?)
    }

    /// Flushes the backend to durable storage.
    pub fn flush(&self) -> SyncResult<()> {
        Ok(self.store.flush()?)
    }

    /// Refetches quarantined records from the remote.
    ///
    /// The key lock is released while the fetch is on the wire; a record
    /// repaired or replaced in the meantime is left alone. Stops at the first
    /// transient transport failure. Returns the number of records repaired.
    pub fn repair_quarantined(&self) -> SyncResult<usize> {
        let mut repaired = 0;
        for quarantined in self.store.quarantined()? {
            let key = quarantined.entity;
            let remote_id = match quarantined.remote_id {
                Some(remote_id) => Some(remote_id),
                None => self.store.remote_id_of(key)?,
            };
            let Some(remote_id) = remote_id else {
                tracing::warn!(entity = %key, "corrupted record never reached the remote, cannot refetch");
                continue;
            };
            let request = FetchRequest {
                entity_type: key.entity_type.as_str().to_string(),
                remote_id: remote_id.clone(),
            };
            let response = match self.transport.fetch(&request) {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(entity = %key, error = %e, "refetch deferred");
                    break;
                }
                Err(e) => {
                    tracing::warn!(entity = %key, error = %e, "refetch failed");
                    continue;
                }
            };
            let entry = self.store.lock(key);
            if !self.store.is_quarantined(key)? {
                tracing::debug!(entity = %key, "record settled while refetching");
                continue;
            }
            match response.payload {
                Some(payload) => {
                    let payload = self.localize(key.entity_type, payload)?;
                    let mut entity = self.remote_entity(key, remote_id, payload, response.version)?;
                    entry.write(&mut entity, ChangeSource::Remote)?;
                    if self.queue.get(&key).is_some_and(|e| !e.transmitted) {
                        self.queue.remove(&key)?;
                    }
                }
                None => {
                    entry.remove(Some(ChangeSource::Remote))?;
                    self.queue.remove(&key)?;
                }
            }
            self.store.clear_quarantine(key)?;
            repaired += 1;
            tracing::info!(entity = %key, "record repaired from remote");
        }
        if repaired > 0 {
            self.stats.write().repaired += repaired as u64;
        }
        Ok(repaired)
    }

    // ------------------------------------------------------------------
    // Sync cycle
    // ------------------------------------------------------------------

    /// Runs one sync cycle.
    ///
    /// Repairs quarantined records, then sends up to
    /// `max_batches_per_cycle` batches of ready entries and applies the
    /// results. Per-item failures are reported in the returned report; a
    /// batch that fails as a whole reschedules its entries and ends the cycle
    /// with the error.
    pub fn sync_cycle(&self) -> SyncResult<SyncCycleReport> {
        let _cycle = self.cycle.lock();
        if !self.is_online() || !self.transport.is_connected() {
            self.set_state(SyncState::Offline);
            return Err(SyncError::NotConnected);
        }

        let start = Instant::now();
        self.set_state(SyncState::Syncing);
        let mut report = SyncCycleReport::default();
        let result = self.run_cycle(&mut report);
        report.remaining = self.queue.len();
        report.duration = start.elapsed();

        match result {
            Ok(()) => {
                self.record(&report, None);
                self.set_state(SyncState::Synced);
                tracing::info!(
                    batches = report.batches,
                    sent = report.sent,
                    accepted = report.accepted,
                    conflicts = report.pending_conflicts.len(),
                    rejected = report.rejected.len(),
                    remaining = report.remaining,
                    "sync cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.record(&report, Some(&e));
                let state = if matches!(e, SyncError::NotConnected) {
                    SyncState::Offline
                } else {
                    SyncState::Error
                };
                self.set_state(state);
                tracing::warn!(error = %e, sent = report.sent, "sync cycle failed");
                Err(e)
            }
        }
    }

    fn run_cycle(&self, report: &mut SyncCycleReport) -> SyncResult<()> {
        report.repaired = self.repair_quarantined()? as u64;
        self.bury_orphans(report)?;

        let mut attempted = HashSet::new();
        for _ in 0..self.config.max_batches_per_cycle {
            let candidates =
                self.queue
                    .select_batch(self.now(), self.config.batch_size, &attempted, |e| self.is_sendable(e));
            if candidates.is_empty() {
                break;
            }

            let mut items = Vec::with_capacity(candidates.len());
            let mut frozen = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                attempted.insert(candidate.op_id);
                if let Some((item, entry)) = self.prepare(candidate)? {
                    items.push(item);
                    frozen.push(entry);
                }
            }
            if items.is_empty() {
                continue;
            }

            report.batches += 1;
            report.sent += items.len() as u64;
            tracing::debug!(items = items.len(), "sending batch");
            match self.transport.send_batch(&BatchRequest::new(items)) {
                Ok(response) => self.apply_response(&frozen, &response, report)?,
                Err(e) => {
                    let counted = !matches!(e, SyncError::NotConnected);
                    let reason = e.to_string();
                    for entry in &frozen {
                        self.fail_entry(entry, &reason, counted, report)?;
                    }
                    return Err(e);
                }
            }
        }

        if self.config.evict_after_cycle {
            match self.store.enforce_budget() {
                Ok(eviction) => report.eviction = Some(eviction),
                Err(CoreError::StorageExhausted {
                    used_bytes,
                    budget_bytes,
                    pinned_or_dirty_bytes,
                    ..
                }) => {
                    tracing::warn!(
                        used_bytes,
                        budget_bytes,
                        pinned_or_dirty_bytes,
                        "cache stays over budget"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Dead-letters untransmitted entries whose parent is gone.
    ///
    /// A parent is gone when it has no remote id and no record that could
    /// still get one, so the entry could never be sent.
    fn bury_orphans(&self, report: &mut SyncCycleReport) -> SyncResult<()> {
        let now = self.now();
        for candidate in self.queue.entries() {
            if candidate.transmitted || candidate.in_flight || candidate.depends_on.is_empty() {
                continue;
            }
            let key = candidate.entity;
            let _lock = self.store.lock(key);
            let Some(entry) = self.queue.get(&key).filter(|e| e.op_id == candidate.op_id) else {
                continue;
            };
            let Some(parent) = self.missing_parent(&entry) else {
                continue;
            };
            let reason = format!("parent {parent} no longer exists");
            if let Some(letter) = self.queue.reject(&key, entry.op_id, &reason, now)? {
                tracing::warn!(entity = %key, parent = %parent, op_id = letter.entry.op_id, "orphaned entry dead-lettered");
                report.rejected.push(RejectedItem {
                    entity: key,
                    op_id: letter.entry.op_id,
                    reason,
                });
            }
        }
        Ok(())
    }

    fn missing_parent(&self, entry: &QueueEntry) -> Option<EntityRef> {
        entry.depends_on.iter().copied().find(|parent| {
            matches!(self.store.remote_id_of(*parent), Ok(None))
                && matches!(self.store.is_referenceable(*parent), Ok(false))
        })
    }

    /// Builds the wire item for a queue entry and freezes the entry.
    ///
    /// Untransmitted entries are rebuilt from the entity's current state;
    /// transmitted ones replay exactly what was sent before.
    fn prepare(&self, candidate: QueueEntry) -> SyncResult<Option<(SyncOperation, QueueEntry)>> {
        let key = candidate.entity;
        let lock = self.store.lock(key);
        let Some(mut entry) = self
            .queue
            .get(&key)
            .filter(|e| e.op_id == candidate.op_id && !e.in_flight)
        else {
            return Ok(None);
        };

        if !entry.transmitted {
            let mut entity = match lock.read() {
                Ok(Some(entity)) => entity,
                Ok(None) => {
                    self.queue.remove(&key)?;
                    return Ok(None);
                }
                Err(e) if e.is_corruption() => {
                    tracing::warn!(entity = %key, "holding entry until the record is repaired");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            if !entity.is_dirty() {
                self.queue.remove(&key)?;
                return Ok(None);
            }

            let operation = operation_for(&entity);
            if operation == OperationType::Delete && entity.remote_id.is_none() {
                self.queue.remove(&key)?;
                lock.remove(Some(ChangeSource::Local))?;
                return Ok(None);
            }
            let mut wire = compute_delta(operation, &entity.payload, entity.metadata.synced_snapshot.as_ref());
            if wire.is_noop() {
                entity.metadata.last_synced_at = Some(entity.metadata.updated_at);
                entity.metadata.recompute_dirty();
                lock.write(&mut entity, ChangeSource::Remote)?;
                self.queue.remove(&key)?;
                tracing::debug!(entity = %key, "no change against the synced snapshot");
                return Ok(None);
            }

            let mut depends_on = Vec::new();
            if operation != OperationType::Delete {
                let graph = self.store.registry().graph();
                let touched = wire.touched_fields();
                let full = matches!(wire, DeltaPayload::Full(_));
                for dep in graph.dependencies_of(key.entity_type, &entity.payload)? {
                    let Some(parent_remote_id) = self.store.remote_id_of(dep.parent)? else {
                        tracing::debug!(entity = %key, parent = %dep.parent, "waiting for parent");
                        return Ok(None);
                    };
                    let reference_changed = graph
                        .parents_of(key.entity_type)
                        .any(|edge| edge.remote_field == dep.remote_field && touched.contains(&edge.local_field));
                    if full || reference_changed {
                        wire.set_field(&dep.remote_field, Value::String(parent_remote_id));
                    }
                    depends_on.push(dep.parent);
                }
            }

            entry.operation = operation;
            entry.delta_payload = wire;
            entry.depends_on = depends_on;
            entry.baseline_version = entity.metadata.remote_version;
            entry.updated_at = entity.metadata.updated_at;
        }

        self.queue.mark_in_flight(std::slice::from_ref(&entry))?;
        let item = SyncOperation {
            op_id: entry.op_id,
            entity_type: key.entity_type.as_str().to_string(),
            operation: entry.operation,
            entity_id: key.local_id.to_string(),
            remote_id: self.store.remote_id_of(key)?,
            delta_payload: entry.delta_payload.clone(),
            baseline_version: entry.baseline_version,
            updated_at: entry.updated_at,
        };
        tracing::debug!(
            entity = %key,
            op_id = entry.op_id,
            operation = entry.operation.as_str(),
            replay = entry.transmitted,
            "item prepared"
        );
        Ok(Some((item, entry)))
    }

    fn apply_response(
        &self,
        frozen: &[QueueEntry],
        response: &BatchResponse,
        report: &mut SyncCycleReport,
    ) -> SyncResult<()> {
        for entry in frozen {
            match response.result_for(entry.op_id) {
                None => self.fail_entry(entry, "no result for item", true, report)?,
                Some(ItemOutcome::Accepted { remote_id, version }) => {
                    self.on_accepted(entry, remote_id, *version)?;
                    report.accepted += 1;
                }
                Some(ItemOutcome::Conflict {
                    remote_id,
                    remote_version,
                    remote_payload,
                    remote_updated_at,
                }) => {
                    let incoming = Incoming {
                        remote_id: remote_id.clone(),
                        version: *remote_version,
                        payload: remote_payload.clone(),
                        updated_at: *remote_updated_at,
                    };
                    match self.on_conflict(entry, incoming)? {
                        Settlement::Pending => report.pending_conflicts.push(entry.entity),
                        Settlement::Resolved(_) => report.auto_resolved += 1,
                        Settlement::Converged => {}
                    }
                }
                Some(ItemOutcome::Rejected { reason }) => self.on_rejected(entry, reason, report)?,
            }
        }
        Ok(())
    }

    fn on_accepted(&self, entry: &QueueEntry, remote_id: &str, version: u64) -> SyncResult<()> {
        let key = entry.entity;
        let lock = self.store.lock(key);
        let follow_up = self.queue.complete(&key, entry.op_id)?;

        if entry.operation == OperationType::Delete {
            lock.remove(Some(ChangeSource::Remote))?;
            self.queue.remove(&key)?;
            tracing::debug!(entity = %key, "remote delete confirmed");
            return Ok(());
        }

        let Some(mut entity) = self.read_for_sync(&lock)? else {
            return Ok(());
        };
        let snapshot = self.confirmed_snapshot(entry, &entity);
        entity.remote_id = Some(remote_id.to_string());
        entity.metadata.mark_synced(entry.updated_at, version, snapshot);
        lock.write(&mut entity, ChangeSource::Remote)?;
        if let Some(follow_up) = follow_up {
            tracing::debug!(entity = %key, follow_up = follow_up.as_str(), "queueing follow-up");
        }
        self.reconcile(&lock, &entity)
    }

    fn on_conflict(&self, entry: &QueueEntry, incoming: Incoming) -> SyncResult<Settlement> {
        let key = entry.entity;
        let lock = self.store.lock(key);
        self.queue.complete(&key, entry.op_id)?;
        let Some(entity) = self.read_for_sync(&lock)? else {
            return Ok(Settlement::Converged);
        };
        let incoming = Incoming {
            payload: incoming
                .payload
                .map(|payload| self.localize(key.entity_type, payload))
                .transpose()?,
            ..incoming
        };
        let settlement = self.settle(&lock, entity, incoming)?;
        if let Some(current) = self.read_for_sync(&lock)? {
            self.reconcile(&lock, &current)?;
        }
        Ok(settlement)
    }

    fn on_rejected(&self, entry: &QueueEntry, reason: &str, report: &mut SyncCycleReport) -> SyncResult<()> {
        let key = entry.entity;
        let lock = self.store.lock(key);
        if let Some(letter) = self.queue.reject(&key, entry.op_id, reason, self.now())? {
            report.rejected.push(RejectedItem {
                entity: key,
                op_id: letter.entry.op_id,
                reason: reason.to_string(),
            });
        }
        // a refused create of an entity deleted since has nothing left to sync
        if let Some(entity) = self.read_for_sync(&lock)? {
            if entity.is_deleted() && entity.remote_id.is_none() {
                lock.remove(Some(ChangeSource::Local))?;
            }
        }
        Ok(())
    }

    fn fail_entry(&self, entry: &QueueEntry, reason: &str, counted: bool, report: &mut SyncCycleReport) -> SyncResult<()> {
        let _lock = self.store.lock(entry.entity);
        let outcome = self
            .queue
            .fail_attempt(&entry.entity, entry.op_id, reason, counted, &self.config.retry, self.now())?;
        match outcome {
            Some(RetryOutcome::Scheduled { attempt, next_retry_at }) => {
                report.retried += 1;
                tracing::debug!(entity = %entry.entity, attempt, next_retry_at, reason, "rescheduled");
            }
            Some(RetryOutcome::DeadLettered(_)) => report.exhausted.push(entry.entity),
            None => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Applies a change pushed by the remote side.
    ///
    /// Clean entities take the remote value. Entities with local changes go
    /// through the conflict policy of their type.
    pub fn apply_remote_change(&self, change: RemoteChange) -> SyncResult<RemoteApplied> {
        let RemoteChange {
            entity_type,
            remote_id,
            version,
            payload,
            updated_at,
        } = change;
        let payload = payload.map(|p| self.localize(entity_type, p)).transpose()?;
        let known = self.store.find_by_remote_id(entity_type, &remote_id)?;
        let local_id = known.unwrap_or_default();
        let key = EntityRef::new(entity_type, local_id);
        let lock = self.store.lock(key);

        let current = match lock.read() {
            Ok(current) => current,
            // the remote copy replaces the damaged record
            Err(e) if e.is_corruption() => None,
            Err(e) => return Err(e.into()),
        };

        let Some(mut entity) = current else {
            let Some(payload) = payload else {
                if known.is_none() {
                    return Ok(RemoteApplied::Ignored);
                }
                lock.remove(None)?;
                self.queue.remove(&key)?;
                self.store.clear_quarantine(key)?;
                return Ok(RemoteApplied::Removed(local_id));
            };
            let mut entity = self.remote_entity(key, remote_id, payload, version)?;
            lock.write(&mut entity, ChangeSource::Remote)?;
            self.store.clear_quarantine(key)?;
            return Ok(if known.is_some() {
                RemoteApplied::Overwritten(local_id)
            } else {
                RemoteApplied::Inserted(local_id)
            });
        };

        if entity.metadata.remote_version.is_some_and(|v| v >= version) {
            tracing::debug!(entity = %key, version, "ignoring stale remote change");
            return Ok(RemoteApplied::Stale);
        }

        if !entity.is_dirty() {
            return match payload {
                Some(payload) => {
                    entity.payload = payload.clone();
                    entity.remote_id = Some(remote_id);
                    entity.metadata.deleted = false;
                    let at = entity.metadata.updated_at;
                    entity.metadata.mark_synced(at, version, payload);
                    lock.write(&mut entity, ChangeSource::Remote)?;
                    Ok(RemoteApplied::Overwritten(local_id))
                }
                None => {
                    lock.remove(Some(ChangeSource::Remote))?;
                    self.queue.remove(&key)?;
                    Ok(RemoteApplied::Removed(local_id))
                }
            };
        }

        let incoming = Incoming {
            remote_id: Some(remote_id),
            version,
            payload,
            updated_at,
        };
        let settlement = self.settle(&lock, entity, incoming)?;
        if let Some(current) = self.read_for_sync(&lock)? {
            self.reconcile(&lock, &current)?;
        }
        let mut stats = self.stats.write();
        Ok(match settlement {
            Settlement::Converged => RemoteApplied::Converged(local_id),
            Settlement::Pending => {
                stats.conflicts_detected += 1;
                RemoteApplied::ConflictPending(local_id)
            }
            Settlement::Resolved(winner) => {
                stats.conflicts_detected += 1;
                stats.conflicts_auto_resolved += 1;
                RemoteApplied::ConflictResolved { local_id, winner }
            }
        })
    }

    /// Settles a pending conflict with an explicit decision.
    ///
    /// Choosing the local or a merged value on a remote delete re-creates the
    /// entity remotely.
    pub fn resolve_conflict(&self, id: &str, choice: ResolutionChoice) -> SyncResult<ConflictRecord> {
        let mut record = self.conflicts.by_id(id)?;
        if !record.is_pending() {
            return Err(SyncError::InvalidOperation(format!("conflict {id} is already resolved")));
        }
        let key = EntityRef::parse_key(id)?;
        let lock = self.store.lock(key);
        let mut entity = lock.read()?.ok_or_else(|| SyncError::NotFound(key.key()))?;
        let now = self.now();

        let (winner, payload) = match choice {
            ResolutionChoice::KeepLocal => (
                ConflictSide::Local,
                (!entity.is_deleted()).then(|| entity.payload.clone()),
            ),
            ResolutionChoice::AcceptRemote => (ConflictSide::Remote, record.remote_version.payload.clone()),
            ResolutionChoice::Merged(value) => {
                self.store.registry().validate(key.entity_type, &value)?;
                (ConflictSide::Merged, Some(value))
            }
        };

        if record.is_remote_delete() {
            match &payload {
                None => {
                    lock.remove(Some(ChangeSource::Remote))?;
                    self.queue.remove(&key)?;
                }
                Some(value) => {
                    // the remote copy is gone, so the kept value is sent as a new entity
                    entity.payload = value.clone();
                    entity.remote_id = None;
                    entity.metadata.deleted = false;
                    entity.metadata.remote_version = None;
                    entity.metadata.synced_snapshot = None;
                    entity.metadata.last_synced_at = None;
                    entity.metadata.touch(now);
                    lock.write(&mut entity, ChangeSource::Local)?;
                }
            }
        } else {
            let incoming = Incoming {
                remote_id: record.remote_id.clone(),
                version: record.remote_version.version.unwrap_or_default(),
                payload: record.remote_version.payload.clone(),
                updated_at: record.remote_version.updated_at,
            };
            self.apply_resolution(&lock, &mut entity, &incoming, payload.clone())?;
        }
        if let Some(current) = self.read_for_sync(&lock)? {
            self.reconcile(&lock, &current)?;
        }

        record.resolve(ConflictResolution::Manual, winner, payload, now);
        self.conflicts.save(&record)?;
        tracing::info!(conflict = id, ?winner, "conflict resolved");
        Ok(record)
    }

    fn settle(&self, lock: &EntryLock<'_>, mut entity: CachedEntity, incoming: Incoming) -> SyncResult<Settlement> {
        let key = lock.entity_ref();
        let local_payload = (!entity.is_deleted()).then(|| entity.payload.clone());

        if local_payload == incoming.payload {
            match &incoming.payload {
                None => {
                    lock.remove(Some(ChangeSource::Remote))?;
                    self.queue.remove(&key)?;
                }
                Some(_) => self.apply_resolution(lock, &mut entity, &incoming, incoming.payload.clone())?,
            }
            tracing::debug!(entity = %key, "local and remote converged");
            return Ok(Settlement::Converged);
        }

        let now = self.now();
        let policy = self.store.registry().policy(key.entity_type);
        let local = VersionSnapshot {
            payload: local_payload,
            version: entity.metadata.remote_version,
            updated_at: entity.metadata.updated_at,
        };
        let remote = VersionSnapshot {
            payload: incoming.payload.clone(),
            version: Some(incoming.version),
            updated_at: incoming.updated_at,
        };
        let base = entity.metadata.synced_snapshot.clone();
        let decision = decide(policy, &local, &remote, base.as_ref());
        let mut record = ConflictRecord::new(
            key.entity_type.as_str(),
            key.local_id.to_string(),
            incoming.remote_id.clone().or_else(|| entity.remote_id.clone()),
            policy,
            local,
            remote,
            base,
            now,
        );

        match decision {
            Decision::Pending => {
                tracing::warn!(
                    entity = %key,
                    ?policy,
                    remote_delete = record.is_remote_delete(),
                    "conflict waiting for a decision"
                );
                self.conflicts.save(&record)?;
                Ok(Settlement::Pending)
            }
            Decision::Resolved { winner, payload } => {
                self.apply_resolution(lock, &mut entity, &incoming, payload.clone())?;
                record.resolve(ConflictResolution::AutoResolved, winner, payload, now);
                self.conflicts.save(&record)?;
                tracing::warn!(entity = %key, ?policy, ?winner, "conflict auto-resolved");
                Ok(Settlement::Resolved(winner))
            }
        }
    }

    /// Writes a resolved value on top of the remote version.
    ///
    /// A value equal to the remote one leaves the entity clean; anything else
    /// stays dirty with the remote version as its new baseline.
    fn apply_resolution(
        &self,
        lock: &EntryLock<'_>,
        entity: &mut CachedEntity,
        incoming: &Incoming,
        resolved: Option<Value>,
    ) -> SyncResult<()> {
        if incoming.remote_id.is_some() {
            entity.remote_id = incoming.remote_id.clone();
        }
        match (resolved, &incoming.payload) {
            (Some(value), Some(remote)) if value == *remote => {
                entity.payload = value;
                entity.metadata.deleted = false;
                let at = entity.metadata.updated_at;
                entity.metadata.mark_synced(at, incoming.version, remote.clone());
            }
            (resolved, remote) => {
                match resolved {
                    Some(value) => {
                        entity.payload = value;
                        entity.metadata.deleted = false;
                    }
                    None => entity.metadata.deleted = true,
                }
                entity.metadata.remote_version = Some(incoming.version);
                entity.metadata.synced_snapshot = remote.clone();
                entity.metadata.touch(self.now());
            }
        }
        lock.write(entity, ChangeSource::Remote)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Brings the queue in line with the entity's state.
    ///
    /// Dirty entities get an entry (coalescing with any existing one); clean
    /// entities lose any entry that has not been sent.
    fn reconcile(&self, lock: &EntryLock<'_>, entity: &CachedEntity) -> SyncResult<()> {
        let key = entity.entity_ref();
        let now = self.now();
        if !entity.is_dirty() {
            if self.queue.get(&key).is_some_and(|e| !e.transmitted) {
                self.queue.remove(&key)?;
            }
            return Ok(());
        }

        let registry = self.store.registry();
        let operation = operation_for(entity);
        let depends_on = match operation {
            OperationType::Delete => Vec::new(),
            _ => registry
                .graph()
                .dependencies_of(key.entity_type, &entity.payload)?
                .into_iter()
                .map(|dep| dep.parent)
                .collect(),
        };
        let request = EnqueueRequest {
            entity: key,
            operation,
            delta_payload: compute_delta(operation, &entity.payload, entity.metadata.synced_snapshot.as_ref()),
            priority: registry.priority(key.entity_type),
            depends_on,
            baseline_version: entity.metadata.remote_version,
            updated_at: entity.metadata.updated_at,
        };

        match self.queue.enqueue(request.clone(), now)? {
            EnqueueOutcome::Cancelled(_) if entity.remote_id.is_some() => {
                self.queue.enqueue(request, now)?;
            }
            EnqueueOutcome::Cancelled(_) => {
                lock.remove(Some(ChangeSource::Local))?;
                tracing::debug!(entity = %key, "create cancelled by delete");
            }
            EnqueueOutcome::FollowUp(_) => {
                tracing::debug!(entity = %key, operation = operation.as_str(), "recorded as follow-up");
            }
            EnqueueOutcome::Queued(_) | EnqueueOutcome::Coalesced(_) => {
                tracing::debug!(entity = %key, operation = operation.as_str(), "enqueued");
            }
        }
        Ok(())
    }

    /// Transmitted entries replay their frozen payload, which already
    /// carries the parents' remote ids.
    fn is_sendable(&self, entry: &QueueEntry) -> bool {
        let parents_ready = entry.transmitted
            || entry
                .depends_on
                .iter()
                .all(|dep| matches!(self.store.remote_id_of(*dep), Ok(Some(_))));
        parents_ready && !self.conflicts.has_pending(&entry.entity).unwrap_or(true)
    }

    fn read_for_sync(&self, lock: &EntryLock<'_>) -> SyncResult<Option<CachedEntity>> {
        match lock.read() {
            Ok(entity) => Ok(entity),
            Err(e) if e.is_corruption() => {
                tracing::warn!(entity = %lock.entity_ref(), error = %e, "skipping corrupted record");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the payload the remote holds after accepting `entry`.
    fn confirmed_snapshot(&self, entry: &QueueEntry, entity: &CachedEntity) -> Value {
        let mut snapshot = match &entry.delta_payload {
            DeltaPayload::Full(value) => value.clone(),
            DeltaPayload::Fields(delta) => {
                let mut base = entity
                    .metadata
                    .synced_snapshot
                    .clone()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                delta.apply_to(&mut base);
                base
            }
            DeltaPayload::Identifier => entity.payload.clone(),
        };
        if let Value::Object(fields) = &mut snapshot {
            for edge in self.store.registry().graph().parents_of(entry.entity.entity_type) {
                fields.remove(&edge.remote_field);
            }
        }
        snapshot
    }

    /// Rewrites remote parent references in a remote payload to local ids.
    fn localize(&self, entity_type: EntityType, mut payload: Value) -> SyncResult<Value> {
        if let Value::Object(fields) = &mut payload {
            for edge in self.store.registry().graph().parents_of(entity_type) {
                let Some(remote_id) = fields.get(&edge.remote_field).and_then(Value::as_str).map(String::from) else {
                    continue;
                };
                if let Some(parent) = self.store.find_by_remote_id(edge.parent, &remote_id)? {
                    fields.insert(edge.local_field.clone(), Value::String(parent.to_string()));
                    fields.remove(&edge.remote_field);
                }
            }
        }
        Ok(payload)
    }

    /// Builds a clean cache entry for a remote value.
    fn remote_entity(&self, key: EntityRef, remote_id: String, payload: Value, version: u64) -> SyncResult<CachedEntity> {
        let config = self.store.registry().config(key.entity_type)?;
        let now = self.now();
        let mut metadata = StorageMetadata::new(config.schema_version, now);
        metadata.ttl_expires_at = config.default_ttl.map(|ttl| now + ttl.as_millis() as u64);
        metadata.mark_synced(now, version, payload.clone());
        Ok(CachedEntity {
            entity_type: key.entity_type,
            local_id: key.local_id,
            remote_id: Some(remote_id),
            payload,
            metadata,
        })
    }

    fn record(&self, report: &SyncCycleReport, error: Option<&SyncError>) {
        let mut stats = self.stats.write();
        stats.items_sent += report.sent;
        stats.items_accepted += report.accepted;
        stats.conflicts_detected += report.pending_conflicts.len() as u64 + report.auto_resolved;
        stats.conflicts_auto_resolved += report.auto_resolved;
        stats.rejected += report.rejected.len() as u64;
        stats.retries += report.retried;
        stats.dead_lettered += (report.rejected.len() + report.exhausted.len()) as u64;
        match error {
            None => {
                stats.cycles_completed += 1;
                stats.last_sync_at = Some(self.now());
                stats.last_error = None;
            }
            Some(e) => stats.last_error = Some(e.to_string()),
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn now(&self) -> u64 {
        self.store.clock().now_ms()
    }
}

fn operation_for(entity: &CachedEntity) -> OperationType {
    if entity.is_deleted() {
        OperationType::Delete
    } else if entity.remote_id.is_none() {
        OperationType::Create
    } else {
        OperationType::Update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::MockTransport;
    use geode_core::ManualClock;
    use geode_storage::InMemoryBackend;
    use geode_sync_protocol::{FetchResponse, ItemResult};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        transport: Arc<MockTransport>,
        engine: SyncEngine<MockTransport>,
    }

    fn harness_with(config: SyncConfig) -> Harness {
        let backend: Arc<dyn TableBackend> = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let transport = Arc::new(MockTransport::new());
        let engine = SyncEngine::open(
            config,
            backend,
            Arc::new(EntityRegistry::rockhounding().unwrap()),
            clock.clone(),
            transport.clone(),
        )
        .unwrap();
        Harness {
            clock,
            transport,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(SyncConfig::default().with_retry(RetryConfig::new(3).with_jitter(false)))
    }

    fn session() -> Value {
        json!({"name": "Quarry ridge", "started_at": 10_000})
    }

    fn accepted(op_id: u64, remote_id: &str, version: u64) -> ItemResult {
        ItemResult {
            op_id,
            outcome: ItemOutcome::Accepted {
                remote_id: remote_id.into(),
                version,
            },
        }
    }

    /// Creates a session and syncs it, returning the synced entity.
    fn synced_session(h: &Harness, remote_id: &str) -> CachedEntity {
        let created = h.engine.create(EntityType::FieldSession, session()).unwrap();
        let op_id = h.engine.pending_entries()[0].op_id;
        h.transport
            .push_batch_response(BatchResponse::new(vec![accepted(op_id, remote_id, 1)]));
        h.engine.sync_cycle().unwrap();
        h.engine
            .get(EntityType::FieldSession, created.local_id)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn accepted_create_marks_entity_synced() {
        let h = harness();
        let synced = synced_session(&h, "rs1");

        assert_eq!(synced.remote_id.as_deref(), Some("rs1"));
        assert!(!synced.is_dirty());
        assert_eq!(synced.metadata.remote_version, Some(1));
        assert_eq!(synced.metadata.synced_snapshot, Some(session()));
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.engine.state(), SyncState::Synced);

        let stats = h.engine.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.items_accepted, 1);

        let sent = &h.transport.sent_batches()[0].items[0];
        assert_eq!(sent.operation, OperationType::Create);
        assert_eq!(sent.delta_payload, DeltaPayload::Full(session()));
    }

    #[test]
    fn update_sends_only_changed_fields() {
        let h = harness();
        let synced = synced_session(&h, "rs1");
        h.clock.advance(Duration::from_secs(1));

        let mut payload = session();
        payload["notes"] = json!("agates near the creek");
        h.engine
            .update(EntityType::FieldSession, synced.local_id, payload.clone())
            .unwrap();
        let op_id = h.engine.pending_entries()[0].op_id;
        h.transport
            .push_batch_response(BatchResponse::new(vec![accepted(op_id, "rs1", 2)]));
        h.engine.sync_cycle().unwrap();

        let item = &h.transport.sent_batches()[1].items[0];
        assert_eq!(item.operation, OperationType::Update);
        assert_eq!(item.baseline_version, Some(1));
        assert_eq!(item.remote_id.as_deref(), Some("rs1"));
        match &item.delta_payload {
            DeltaPayload::Fields(delta) => {
                assert_eq!(delta.set.len(), 1);
                assert_eq!(delta.set.get("notes"), Some(&json!("agates near the creek")));
            }
            other => panic!("expected field delta, got {other:?}"),
        }

        let entity = h.engine.get(EntityType::FieldSession, synced.local_id).unwrap().unwrap();
        assert!(!entity.is_dirty());
        assert_eq!(entity.metadata.synced_snapshot, Some(payload));
    }

    #[test]
    fn offline_cycle_refuses_to_start() {
        let h = harness();
        h.engine.create(EntityType::FieldSession, session()).unwrap();
        h.engine.set_online(false);

        assert!(matches!(h.engine.sync_cycle(), Err(SyncError::NotConnected)));
        assert_eq!(h.engine.state(), SyncState::Offline);
        assert!(h.transport.sent_batches().is_empty());
        assert_eq!(h.engine.pending_count(), 1);

        h.engine.set_online(true);
        assert_eq!(h.engine.state(), SyncState::Idle);
    }

    #[test]
    fn delete_before_sync_cancels_entry() {
        let h = harness();
        let created = h.engine.create(EntityType::FieldSession, session()).unwrap();
        assert_eq!(
            h.engine.delete(EntityType::FieldSession, created.local_id).unwrap(),
            DeleteOutcome::Removed
        );
        assert_eq!(h.engine.pending_count(), 0);
        assert!(h.engine.get(EntityType::FieldSession, created.local_id).unwrap().is_none());
    }

    #[test]
    fn delete_after_sync_sends_identifier() {
        let h = harness();
        let synced = synced_session(&h, "rs1");
        assert_eq!(
            h.engine.delete(EntityType::FieldSession, synced.local_id).unwrap(),
            DeleteOutcome::Tombstoned
        );
        let op_id = h.engine.pending_entries()[0].op_id;
        h.transport
            .push_batch_response(BatchResponse::new(vec![accepted(op_id, "rs1", 2)]));
        h.engine.sync_cycle().unwrap();

        let item = &h.transport.sent_batches()[1].items[0];
        assert_eq!(item.operation, OperationType::Delete);
        assert_eq!(item.delta_payload, DeltaPayload::Identifier);
        assert!(h
            .engine
            .store()
            .lock(synced.entity_ref())
            .read()
            .unwrap()
            .is_none());
        assert!(h.engine.store().find_by_remote_id(EntityType::FieldSession, "rs1").unwrap().is_none());
    }

    #[test]
    fn missing_result_is_retried_with_backoff() {
        let h = harness();
        h.engine.create(EntityType::FieldSession, session()).unwrap();
        h.transport.push_batch_response(BatchResponse::default());

        let report = h.engine.sync_cycle().unwrap();
        assert_eq!(report.retried, 1);
        let entry = &h.engine.pending_entries()[0];
        assert_eq!(entry.attempt, 1);
        assert_eq!(entry.next_retry_at, 11_000);
        assert!(entry.transmitted);
        assert!(h.engine.next_ready().is_none());

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.engine.next_ready().unwrap().op_id, entry.op_id);
    }

    #[test]
    fn batch_failure_reschedules_and_reports_error() {
        let h = harness();
        h.engine.create(EntityType::FieldSession, session()).unwrap();
        h.transport.push_batch_error(SyncError::Timeout);

        assert!(matches!(h.engine.sync_cycle(), Err(SyncError::Timeout)));
        assert_eq!(h.engine.state(), SyncState::Error);
        assert_eq!(h.engine.pending_entries()[0].attempt, 1);
        assert!(h.engine.stats().last_error.is_some());
    }

    #[test]
    fn exhausted_retries_become_dead_letters() {
        let h = harness_with(SyncConfig::default().with_retry(RetryConfig::new(1)));
        let created = h.engine.create(EntityType::FieldSession, session()).unwrap();
        h.transport.push_batch_response(BatchResponse::default());

        let report = h.engine.sync_cycle().unwrap();
        assert_eq!(report.exhausted, vec![created.entity_ref()]);
        assert_eq!(h.engine.pending_count(), 0);
        let letters = h.engine.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert!(!letters[0].permanent);

        // the entity is still dirty, so a retry requeues it
        assert!(h.engine.retry_dead_letter(letters[0].entry.op_id).unwrap());
        assert_eq!(h.engine.pending_count(), 1);
        assert!(h.engine.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn rejection_is_surfaced_and_not_retried() {
        let h = harness();
        let created = h.engine.create(EntityType::FieldSession, session()).unwrap();
        let op_id = h.engine.pending_entries()[0].op_id;
        h.transport.push_batch_response(BatchResponse::new(vec![ItemResult {
            op_id,
            outcome: ItemOutcome::Rejected {
                reason: "name too long".into(),
            },
        }]));

        let report = h.engine.sync_cycle().unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].entity, created.entity_ref());
        assert!(!report.is_clean());
        assert_eq!(h.engine.pending_count(), 0);
        assert!(h.engine.dead_letters().unwrap()[0].permanent);
        assert_eq!(h.engine.stats().rejected, 1);

        let letter = h.engine.discard_dead_letter(op_id).unwrap();
        assert_eq!(letter.reason, "name too long");
        // local data is kept
        assert!(h.engine.get(EntityType::FieldSession, created.local_id).unwrap().is_some());
    }

    #[test]
    fn remote_push_updates_clean_entity() {
        let h = harness();
        let synced = synced_session(&h, "rs1");
        let changes = h.engine.subscribe(Some(ChangeSource::Remote));

        let mut remote = session();
        remote["notes"] = json!("edited on the web");
        let applied = h
            .engine
            .apply_remote_change(RemoteChange {
                entity_type: EntityType::FieldSession,
                remote_id: "rs1".into(),
                version: 2,
                payload: Some(remote.clone()),
                updated_at: 20_000,
            })
            .unwrap();
        assert_eq!(applied, RemoteApplied::Overwritten(synced.local_id));

        let entity = h.engine.get(EntityType::FieldSession, synced.local_id).unwrap().unwrap();
        assert_eq!(entity.payload, remote);
        assert!(!entity.is_dirty());
        assert_eq!(entity.metadata.remote_version, Some(2));
        assert_eq!(changes.try_recv().unwrap().changed_ids, vec![synced.local_id]);

        let stale = h
            .engine
            .apply_remote_change(RemoteChange {
                entity_type: EntityType::FieldSession,
                remote_id: "rs1".into(),
                version: 2,
                payload: Some(session()),
                updated_at: 21_000,
            })
            .unwrap();
        assert_eq!(stale, RemoteApplied::Stale);
    }

    #[test]
    fn remote_push_of_unknown_entity_inserts_clean_copy() {
        let h = harness();
        let applied = h
            .engine
            .apply_remote_change(RemoteChange {
                entity_type: EntityType::FieldSession,
                remote_id: "rs-new".into(),
                version: 4,
                payload: Some(session()),
                updated_at: 5_000,
            })
            .unwrap();
        let RemoteApplied::Inserted(local_id) = applied else {
            panic!("expected insert, got {applied:?}");
        };
        let entity = h.engine.get(EntityType::FieldSession, local_id).unwrap().unwrap();
        assert!(!entity.is_dirty());
        assert_eq!(entity.remote_id.as_deref(), Some("rs-new"));
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[test]
    fn quarantined_record_is_repaired_from_remote() {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let transport = Arc::new(MockTransport::new());
        let engine = SyncEngine::open(
            SyncConfig::default(),
            backend.clone(),
            Arc::new(EntityRegistry::rockhounding().unwrap()),
            clock,
            transport.clone(),
        )
        .unwrap();
        let created = engine.create(EntityType::FieldSession, session()).unwrap();
        let op_id = engine.pending_entries()[0].op_id;
        transport.push_batch_response(BatchResponse::new(vec![accepted(op_id, "rs1", 1)]));
        engine.sync_cycle().unwrap();

        let table = EntityType::FieldSession.table_name();
        assert!(backend.tamper(&table, &created.entity_ref().key(), |bytes| {
            if let Some(pos) = bytes.windows(6).position(|w| w == b"Quarry") {
                bytes[pos] = b'q';
            }
        }));
        assert!(engine.get(EntityType::FieldSession, created.local_id).unwrap_err().to_string().contains("corrupt"));
        assert_eq!(engine.store().quarantined().unwrap().len(), 1);

        transport.set_fetch_response(FetchResponse {
            payload: Some(session()),
            version: 1,
            updated_at: 10_000,
        });
        assert_eq!(engine.repair_quarantined().unwrap(), 1);
        let repaired = engine.get(EntityType::FieldSession, created.local_id).unwrap().unwrap();
        assert_eq!(repaired.payload, session());
        assert!(engine.store().quarantined().unwrap().is_empty());
        assert_eq!(engine.stats().repaired, 1);
    }

    /// Mock transport that runs a hook whenever a fetch goes out.
    struct FetchHook {
        inner: MockTransport,
        on_fetch: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    }

    impl SyncTransport for FetchHook {
        fn send_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
            self.inner.send_batch(request)
        }

        fn fetch(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
            if let Some(hook) = self.on_fetch.lock().as_ref() {
                hook();
            }
            self.inner.fetch(request)
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    #[test]
    fn refetch_leaves_the_key_free_for_concurrent_writers() {
        let backend = Arc::new(InMemoryBackend::new());
        let transport = Arc::new(FetchHook {
            inner: MockTransport::new(),
            on_fetch: Mutex::new(None),
        });
        let engine = Arc::new(
            SyncEngine::open(
                SyncConfig::default(),
                backend.clone(),
                Arc::new(EntityRegistry::rockhounding().unwrap()),
                Arc::new(ManualClock::new(10_000)),
                transport.clone(),
            )
            .unwrap(),
        );
        let created = engine.create(EntityType::FieldSession, session()).unwrap();
        let op_id = engine.pending_entries()[0].op_id;
        transport
            .inner
            .push_batch_response(BatchResponse::new(vec![accepted(op_id, "rs1", 1)]));
        engine.sync_cycle().unwrap();

        let key = created.entity_ref();
        assert!(backend.tamper(&EntityType::FieldSession.table_name(), &key.key(), |bytes| {
            if let Some(pos) = bytes.windows(6).position(|w| w == b"Quarry") {
                bytes[pos] = b'q';
            }
        }));
        assert!(engine.get(EntityType::FieldSession, created.local_id).is_err());

        // a push lands while the refetch is outstanding
        let newer = json!({"name": "Quarry ridge (renamed)", "started_at": 10_000});
        let held = Arc::new(AtomicBool::new(true));
        let (weak, seen, pushed) = (Arc::downgrade(&engine), held.clone(), newer.clone());
        *transport.on_fetch.lock() = Some(Box::new(move || {
            let Some(engine) = weak.upgrade() else { return };
            let locked = engine.store().is_locked(key);
            seen.store(locked, Ordering::SeqCst);
            if !locked {
                engine
                    .apply_remote_change(RemoteChange {
                        entity_type: EntityType::FieldSession,
                        remote_id: "rs1".into(),
                        version: 2,
                        payload: Some(pushed.clone()),
                        updated_at: 10_000,
                    })
                    .unwrap();
            }
        }));
        transport.inner.set_fetch_response(FetchResponse {
            payload: Some(session()),
            version: 1,
            updated_at: 10_000,
        });

        assert_eq!(engine.repair_quarantined().unwrap(), 0);
        assert!(!held.load(Ordering::SeqCst));
        let current = engine.get(EntityType::FieldSession, created.local_id).unwrap().unwrap();
        assert_eq!(current.payload, newer);
        assert_eq!(current.metadata.remote_version, Some(2));
        assert!(engine.store().quarantined().unwrap().is_empty());
    }
}
