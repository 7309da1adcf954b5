//! The local entity store.
//!
//! Entities live in one table per type (`entities.<type>`), keyed by
//! `type:local_id`. Every read verifies the payload checksum and upgrades
//! records written under an older schema. Every operation on a key runs under
//! that key's lock; [`LocalStore::lock`] exposes the lock so the sync engine
//! can combine several steps on one entity atomically.

use crate::change_feed::{ChangeFeed, ChangeNotification, ChangeSource};
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::entity::{CachedEntity, EntityRef, EntityType, LocalId};
use crate::error::{CoreError, CoreResult};
use crate::lock::{KeyGuard, KeyLocks};
use crate::metadata::{self, RecordDefect, StorageMetadata};
use crate::registry::EntityRegistry;
use geode_storage::TableBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Table of corrupted records awaiting refetch.
pub const QUARANTINE_TABLE: &str = "quarantine";
/// Table mapping `type:remote_id` to local ids.
pub const REMOTE_INDEX_TABLE: &str = "remote_index";
/// Table mapping entity keys to remote ids.
///
/// Survives eviction, so dependents of an evicted parent still resolve the
/// parent's remote id.
pub const LOCAL_INDEX_TABLE: &str = "local_index";

/// A record that failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// The affected entity.
    pub entity: EntityRef,
    /// Remote id, if the envelope was still readable.
    pub remote_id: Option<String>,
    /// What was wrong.
    pub reason: String,
    /// Detection time (ms since epoch).
    pub detected_at: u64,
}

/// Result of a local delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The entity never reached the remote and was removed outright.
    Removed,
    /// The entity was marked deleted and awaits the remote delete.
    Tombstoned,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries removed.
    pub evicted: usize,
    /// Bytes freed.
    pub freed_bytes: u64,
    /// Bytes in use afterwards.
    pub used_bytes: u64,
}

/// Result of an eager migration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    /// Records upgraded.
    pub migrated: usize,
    /// Records that could not be upgraded, with the reason.
    pub failed: Vec<(EntityRef, String)>,
}

struct Candidate {
    entity: EntityRef,
    ttl_expires_at: Option<u64>,
    updated_at: u64,
}

/// Durable, typed store of cached entities.
pub struct LocalStore {
    backend: Arc<dyn TableBackend>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
    feed: Arc<ChangeFeed>,
    locks: KeyLocks,
    config: StoreConfig,
}

impl LocalStore {
    /// Creates a store over `backend`.
    pub fn new(
        backend: Arc<dyn TableBackend>,
        registry: Arc<EntityRegistry>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            clock,
            feed: Arc::new(ChangeFeed::new()),
            locks: KeyLocks::new(),
            config,
        }
    }

    /// Returns the backend.
    pub fn backend(&self) -> &Arc<dyn TableBackend> {
        &self.backend
    }

    /// Returns the registry.
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the change feed.
    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Takes the lock of one entity.
    pub fn lock(&self, entity: EntityRef) -> EntryLock<'_> {
        let guard = self.locks.lock(&entity.key());
        EntryLock {
            store: self,
            entity,
            _guard: guard,
        }
    }

    /// Reads a live entity.
    pub fn get(&self, entity_type: EntityType, local_id: LocalId) -> CoreResult<Option<CachedEntity>> {
        self.lock(EntityRef::new(entity_type, local_id)).get()
    }

    /// Creates a new entity with a fresh local id.
    pub fn insert(&self, entity_type: EntityType, payload: Value) -> CoreResult<CachedEntity> {
        self.put(entity_type, LocalId::new(), payload)
    }

    /// Writes a payload locally.
    pub fn put(&self, entity_type: EntityType, local_id: LocalId, payload: Value) -> CoreResult<CachedEntity> {
        self.lock(EntityRef::new(entity_type, local_id)).put(payload)
    }

    /// Deletes an entity locally.
    ///
    /// Entities without a remote id are removed; others become tombstones.
    pub fn delete(&self, entity_type: EntityType, local_id: LocalId) -> CoreResult<DeleteOutcome> {
        let entry = self.lock(EntityRef::new(entity_type, local_id));
        let entity = entry
            .get()?
            .ok_or_else(|| CoreError::not_found(entry.entity_ref().key()))?;
        if entity.remote_id.is_none() {
            entry.remove(Some(ChangeSource::Local))?;
            Ok(DeleteOutcome::Removed)
        } else {
            entry.tombstone()?;
            Ok(DeleteOutcome::Tombstoned)
        }
    }

    /// Lists live entities of a type in key order.
    ///
    /// Corrupted records are quarantined and skipped.
    pub fn list(&self, entity_type: EntityType) -> CoreResult<Vec<CachedEntity>> {
        let mut entities = Vec::new();
        for entity in self.keys(entity_type)? {
            match self.lock(entity).get() {
                Ok(Some(e)) => entities.push(e),
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    tracing::warn!(entity = %entity, error = %e, "skipping corrupted record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entities)
    }

    /// Pins an entity so eviction never drops it.
    pub fn pin(&self, entity_type: EntityType, local_id: LocalId) -> CoreResult<()> {
        self.lock(EntityRef::new(entity_type, local_id)).set_pinned(true)
    }

    /// Removes a pin.
    pub fn unpin(&self, entity_type: EntityType, local_id: LocalId) -> CoreResult<()> {
        self.lock(EntityRef::new(entity_type, local_id)).set_pinned(false)
    }

    /// Looks up the local id of a remote entity.
    pub fn find_by_remote_id(&self, entity_type: EntityType, remote_id: &str) -> CoreResult<Option<LocalId>> {
        let Some(bytes) = self
            .backend
            .get(REMOTE_INDEX_TABLE, &remote_index_key(entity_type, remote_id))?
        else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::corruption(remote_index_key(entity_type, remote_id), "bad remote index row"))?;
        Ok(Some(id))
    }

    /// Returns the remote id assigned to an entity, even if it was evicted.
    pub fn remote_id_of(&self, entity: EntityRef) -> CoreResult<Option<String>> {
        let Some(bytes) = self.backend.get(LOCAL_INDEX_TABLE, &entity.key())? else {
            return Ok(None);
        };
        let remote_id = String::from_utf8(bytes)
            .map_err(|_| CoreError::corruption(entity.key(), "bad local index row"))?;
        Ok(Some(remote_id))
    }

    /// Returns true if `entity` can be referenced by a new child.
    ///
    /// That is a live record, a corrupted one awaiting repair, or one evicted
    /// after it reached the remote. Tombstones and removed records cannot.
    pub fn is_referenceable(&self, entity: EntityRef) -> CoreResult<bool> {
        match self.backend.get(&entity.entity_type.table_name(), &entity.key())? {
            Some(bytes) => Ok(metadata::peek(&bytes).map_or(true, |(_, meta)| !meta.deleted)),
            None => Ok(self.remote_id_of(entity)?.is_some()),
        }
    }

    /// Returns true if a quarantine entry exists for `entity`.
    pub fn is_quarantined(&self, entity: EntityRef) -> CoreResult<bool> {
        Ok(self.backend.get(QUARANTINE_TABLE, &entity.key())?.is_some())
    }

    /// Returns true if some caller currently holds `entity`'s lock.
    pub fn is_locked(&self, entity: EntityRef) -> bool {
        self.locks.is_locked(&entity.key())
    }

    /// Returns the stored size of all entities.
    pub fn total_size(&self) -> CoreResult<u64> {
        let mut total = 0;
        for entity_type in self.registry.types() {
            for (_, bytes) in self.backend.scan(&entity_type.table_name())? {
                total += metadata::peek(&bytes).map_or(bytes.len() as u64, |(_, m)| m.size_bytes);
            }
        }
        Ok(total)
    }

    /// Evicts clean, unpinned entries until the store fits `budget_bytes`.
    ///
    /// Candidates are ordered by TTL expiry (entries without a TTL last) and
    /// then by age. Dirty, pinned, tombstoned and never-synced entries are
    /// never touched. Fails with `StorageExhausted` if the budget cannot be
    /// reached; entries evicted up to that point stay evicted.
    pub fn run_eviction(&self, budget_bytes: u64) -> CoreResult<EvictionReport> {
        let mut used = 0u64;
        let mut protected = 0u64;
        let mut candidates = Vec::new();

        for entity_type in self.registry.types() {
            for (key, bytes) in self.backend.scan(&entity_type.table_name())? {
                let Some((remote_id, meta)) = metadata::peek(&bytes) else {
                    used += bytes.len() as u64;
                    protected += bytes.len() as u64;
                    continue;
                };
                used += meta.size_bytes;
                if !meta.is_evictable(remote_id.is_some()) {
                    protected += meta.size_bytes;
                    continue;
                }
                let Ok(entity) = EntityRef::parse_key(&key) else {
                    continue;
                };
                candidates.push(Candidate {
                    entity,
                    ttl_expires_at: meta.ttl_expires_at,
                    updated_at: meta.updated_at,
                });
            }
        }

        let mut report = EvictionReport {
            used_bytes: used,
            ..EvictionReport::default()
        };
        if used <= budget_bytes {
            return Ok(report);
        }

        candidates.sort_by_key(|c| (c.ttl_expires_at.unwrap_or(u64::MAX), c.updated_at));
        for candidate in candidates {
            if report.used_bytes <= budget_bytes {
                break;
            }
            let entry = self.lock(candidate.entity);
            if let Some(freed) = entry.evict_if_eligible(None)? {
                report.evicted += 1;
                report.freed_bytes += freed;
                report.used_bytes = report.used_bytes.saturating_sub(freed);
                tracing::debug!(entity = %candidate.entity, freed, "evicted");
            }
        }

        if report.used_bytes > budget_bytes {
            tracing::warn!(
                used = report.used_bytes,
                budget = budget_bytes,
                protected,
                "eviction could not reach budget"
            );
            return Err(CoreError::StorageExhausted {
                used_bytes: report.used_bytes,
                budget_bytes,
                pinned_or_dirty_bytes: protected,
                evicted: report.evicted,
            });
        }
        tracing::info!(evicted = report.evicted, freed = report.freed_bytes, "eviction finished");
        Ok(report)
    }

    /// Runs eviction against the configured budget.
    pub fn enforce_budget(&self) -> CoreResult<EvictionReport> {
        self.run_eviction(self.config.storage_budget_bytes)
    }

    /// Removes clean, unpinned entries whose TTL has elapsed.
    pub fn purge_expired(&self) -> CoreResult<usize> {
        let now = self.clock.now_ms();
        let mut purged = 0;
        for entity_type in self.registry.types() {
            for (key, bytes) in self.backend.scan(&entity_type.table_name())? {
                let Some((remote_id, meta)) = metadata::peek(&bytes) else {
                    continue;
                };
                if !meta.is_evictable(remote_id.is_some()) || !meta.is_expired(now) {
                    continue;
                }
                let Ok(entity) = EntityRef::parse_key(&key) else {
                    continue;
                };
                if self.lock(entity).evict_if_eligible(Some(now))?.is_some() {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            tracing::info!(purged, "purged expired entries");
        }
        Ok(purged)
    }

    /// Upgrades every record older than its type's schema version.
    pub fn migrate_all(&self) -> CoreResult<MigrationReport> {
        let mut report = MigrationReport::default();
        for entity_type in self.registry.types() {
            let current = self.registry.config(entity_type)?.schema_version;
            for (key, bytes) in self.backend.scan(&entity_type.table_name())? {
                let Some((_, meta)) = metadata::peek(&bytes) else {
                    continue;
                };
                if meta.schema_version >= current {
                    continue;
                }
                let Ok(entity) = EntityRef::parse_key(&key) else {
                    continue;
                };
                match self.lock(entity).read() {
                    Ok(_) => report.migrated += 1,
                    Err(e) => report.failed.push((entity, e.to_string())),
                }
            }
        }
        tracing::info!(
            migrated = report.migrated,
            failed = report.failed.len(),
            "eager migration finished"
        );
        Ok(report)
    }

    /// Returns quarantined records.
    pub fn quarantined(&self) -> CoreResult<Vec<QuarantineEntry>> {
        let mut entries = Vec::new();
        for (key, bytes) in self.backend.scan(QUARANTINE_TABLE)? {
            match ciborium::de::from_reader::<QuarantineEntry, _>(bytes.as_slice()) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(key, error = %e, "unreadable quarantine row"),
            }
        }
        Ok(entries)
    }

    /// Removes a quarantine entry, returning true if there was one.
    pub fn clear_quarantine(&self, entity: EntityRef) -> CoreResult<bool> {
        Ok(self.backend.delete(QUARANTINE_TABLE, &entity.key())?)
    }

    /// Flushes the backend.
    pub fn flush(&self) -> CoreResult<()> {
        Ok(self.backend.flush()?)
    }

    fn keys(&self, entity_type: EntityType) -> CoreResult<Vec<EntityRef>> {
        Ok(self
            .backend
            .scan(&entity_type.table_name())?
            .into_iter()
            .filter_map(|(key, _)| EntityRef::parse_key(&key).ok())
            .collect())
    }

    /// Fails if `payload` references a parent that cannot be referenced.
    ///
    /// References already present in `previous` are not checked again, so an
    /// edit to a child of a since-deleted parent still goes through.
    fn check_references(&self, entity_type: EntityType, payload: &Value, previous: Option<&Value>) -> CoreResult<()> {
        let graph = self.registry.graph();
        let known = match previous {
            Some(previous) => graph.dependencies_of(entity_type, previous).unwrap_or_default(),
            None => Vec::new(),
        };
        for dep in graph.dependencies_of(entity_type, payload)? {
            if known.iter().any(|k| k.parent == dep.parent) {
                continue;
            }
            if !self.is_referenceable(dep.parent)? {
                return Err(CoreError::validation(
                    entity_type.as_str(),
                    format!("references {} which does not exist", dep.parent),
                ));
            }
        }
        Ok(())
    }

    fn quarantine(&self, entity: EntityRef, defect: &RecordDefect) -> CoreResult<()> {
        let entry = QuarantineEntry {
            entity,
            remote_id: defect.remote_id().map(String::from),
            reason: defect.message().to_string(),
            detected_at: self.clock.now_ms(),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&entry, &mut bytes).map_err(|e| CoreError::encoding(e.to_string()))?;
        self.backend.put(QUARANTINE_TABLE, &entity.key(), &bytes)?;
        tracing::warn!(entity = %entity, reason = %entry.reason, "record quarantined");
        Ok(())
    }
}

fn remote_index_key(entity_type: EntityType, remote_id: &str) -> String {
    format!("{entity_type}:{remote_id}")
}

/// Exclusive access to one entity.
///
/// Holds the entity's key lock until dropped.
pub struct EntryLock<'a> {
    store: &'a LocalStore,
    entity: EntityRef,
    _guard: KeyGuard<'a>,
}

impl EntryLock<'_> {
    /// Returns the locked entity's reference.
    pub fn entity_ref(&self) -> EntityRef {
        self.entity
    }

    /// Reads the record, tombstones included.
    ///
    /// Verifies the checksum and upgrades old schema versions. A record that
    /// fails verification is quarantined and reported as `Corruption`.
    pub fn read(&self) -> CoreResult<Option<CachedEntity>> {
        let table = self.entity.entity_type.table_name();
        let Some(bytes) = self.store.backend.get(&table, &self.entity.key())? else {
            return Ok(None);
        };
        let mut entity = match metadata::open(&bytes) {
            Ok(entity) => entity,
            Err(defect) => {
                self.store.quarantine(self.entity, &defect)?;
                return Err(CoreError::corruption(self.entity.key(), defect.message()));
            }
        };

        let config = self.store.registry.config(self.entity.entity_type)?;
        if entity.metadata.schema_version != config.schema_version {
            let from = entity.metadata.schema_version;
            let upgraded = config
                .migrations
                .upgrade(self.entity.entity_type, entity.payload, from, config.schema_version)?;
            config
                .schema
                .validate(self.entity.entity_type, &upgraded)
                .map_err(|e| CoreError::migration_failed(format!("{}: {e}", self.entity)))?;
            entity.payload = upgraded;
            entity.metadata.synced_snapshot = entity.metadata.synced_snapshot.take().and_then(|snapshot| {
                config
                    .migrations
                    .upgrade(self.entity.entity_type, snapshot, from, config.schema_version)
                    .ok()
            });
            entity.metadata.schema_version = config.schema_version;
            self.persist(&mut entity)?;
            tracing::info!(entity = %self.entity, from, to = config.schema_version, "migrated record");
            self.notify(ChangeSource::Migration);
        }
        Ok(Some(entity))
    }

    /// Reads the entity unless it is a tombstone.
    pub fn get(&self) -> CoreResult<Option<CachedEntity>> {
        Ok(self.read()?.filter(|e| !e.is_deleted()))
    }

    /// Writes a payload as a local change.
    ///
    /// Validates it, advances `updated_at`, marks the entity dirty and
    /// applies the type's default TTL.
    pub fn put(&self, payload: Value) -> CoreResult<CachedEntity> {
        let entity_type = self.entity.entity_type;
        self.store.registry.validate(entity_type, &payload)?;
        let config = self.store.registry.config(entity_type)?;
        let now = self.store.clock.now_ms();

        let mut entity = match self.read()? {
            Some(existing) if existing.is_deleted() => {
                return Err(CoreError::invalid_operation(format!("{} is deleted", self.entity)));
            }
            Some(mut existing) => {
                self.store
                    .check_references(entity_type, &payload, Some(&existing.payload))?;
                existing.payload = payload;
                existing.metadata.touch(now);
                existing
            }
            None => {
                self.store.check_references(entity_type, &payload, None)?;
                CachedEntity {
                    entity_type,
                    local_id: self.entity.local_id,
                    remote_id: None,
                    payload,
                    metadata: StorageMetadata::new(config.schema_version, now),
                }
            }
        };
        entity.metadata.ttl_expires_at = config.default_ttl.map(|ttl| now + ttl.as_millis() as u64);
        self.persist(&mut entity)?;
        self.notify(ChangeSource::Local);
        Ok(entity)
    }

    /// Marks the entity deleted, pending the remote delete.
    pub fn tombstone(&self) -> CoreResult<CachedEntity> {
        let mut entity = self
            .read()?
            .ok_or_else(|| CoreError::not_found(self.entity.key()))?;
        if entity.is_deleted() {
            return Err(CoreError::invalid_operation(format!("{} is already deleted", self.entity)));
        }
        entity.metadata.deleted = true;
        entity.metadata.touch(self.store.clock.now_ms());
        self.persist(&mut entity)?;
        self.notify(ChangeSource::Local);
        Ok(entity)
    }

    /// Removes the record and its id mappings.
    pub fn remove(&self, source: Option<ChangeSource>) -> CoreResult<bool> {
        let table = self.entity.entity_type.table_name();
        let key = self.entity.key();
        let backend = &self.store.backend;
        let remote_id = match backend.get(&table, &key)? {
            Some(bytes) => metadata::peek(&bytes).and_then(|(remote_id, _)| remote_id),
            None => None,
        };
        if let Some(remote_id) = remote_id.or(self.store.remote_id_of(self.entity)?) {
            backend.delete(REMOTE_INDEX_TABLE, &remote_index_key(self.entity.entity_type, &remote_id))?;
        }
        backend.delete(LOCAL_INDEX_TABLE, &key)?;
        let existed = backend.delete(&table, &key)?;
        if existed {
            if let Some(source) = source {
                self.notify(source);
            }
        }
        Ok(existed)
    }

    /// Persists an entity as given, recomputing checksum and size.
    ///
    /// Used by the sync engine after it has adjusted payload or metadata.
    pub fn write(&self, entity: &mut CachedEntity, source: ChangeSource) -> CoreResult<()> {
        if entity.entity_ref() != self.entity {
            return Err(CoreError::invalid_operation(format!(
                "lock on {} cannot write {}",
                self.entity,
                entity.entity_ref()
            )));
        }
        let previous = self.store.remote_id_of(self.entity)?;
        if previous.is_some() && previous != entity.remote_id {
            self.unmap(previous.as_deref())?;
        }
        self.persist(entity)?;
        self.notify(source);
        Ok(())
    }

    /// Sets or clears the pin.
    pub fn set_pinned(&self, pinned: bool) -> CoreResult<()> {
        let mut entity = self.get()?.ok_or_else(|| CoreError::not_found(self.entity.key()))?;
        if entity.metadata.pinned != pinned {
            entity.metadata.pinned = pinned;
            self.persist(&mut entity)?;
        }
        Ok(())
    }

    /// Re-checks eviction eligibility under the lock and removes the record.
    ///
    /// With `expired_at`, the entry must also have expired by then. Returns
    /// the bytes freed.
    fn evict_if_eligible(&self, expired_at: Option<u64>) -> CoreResult<Option<u64>> {
        let table = self.entity.entity_type.table_name();
        let Some(bytes) = self.store.backend.get(&table, &self.entity.key())? else {
            return Ok(None);
        };
        let Some((remote_id, meta)) = metadata::peek(&bytes) else {
            return Ok(None);
        };
        if !meta.is_evictable(remote_id.is_some()) {
            return Ok(None);
        }
        if expired_at.is_some_and(|now| !meta.is_expired(now)) {
            return Ok(None);
        }
        // id mappings stay so dependents and remote updates still find it
        self.store.backend.delete(&table, &self.entity.key())?;
        Ok(Some(meta.size_bytes))
    }

    fn unmap(&self, remote_id: Option<&str>) -> CoreResult<()> {
        let backend = &self.store.backend;
        if let Some(remote_id) = remote_id {
            backend.delete(REMOTE_INDEX_TABLE, &remote_index_key(self.entity.entity_type, remote_id))?;
        }
        backend.delete(LOCAL_INDEX_TABLE, &self.entity.key())?;
        Ok(())
    }

    fn persist(&self, entity: &mut CachedEntity) -> CoreResult<()> {
        let bytes = metadata::seal(entity)?;
        let backend = &self.store.backend;
        backend.put(&self.entity.entity_type.table_name(), &self.entity.key(), &bytes)?;
        if let Some(remote_id) = &entity.remote_id {
            backend.put(
                REMOTE_INDEX_TABLE,
                &remote_index_key(self.entity.entity_type, remote_id),
                self.entity.local_id.to_string().as_bytes(),
            )?;
            backend.put(LOCAL_INDEX_TABLE, &self.entity.key(), remote_id.as_bytes())?;
        }
        Ok(())
    }

    fn notify(&self, source: ChangeSource) {
        self.store.feed.emit(ChangeNotification::single(
            self.entity.entity_type,
            self.entity.local_id,
            source,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::migration::{MigrationKind, MigrationStep, MigrationTable};
    use crate::registry::{EntityTypeConfig, RegistryBuilder};
    use crate::schema::{EntitySchema, FieldKind};
    use geode_storage::InMemoryBackend;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        backend: Arc<InMemoryBackend>,
        clock: Arc<ManualClock>,
        store: LocalStore,
    }

    fn harness_with(registry: EntityRegistry) -> Harness {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = LocalStore::new(
            backend.clone(),
            Arc::new(registry),
            clock.clone(),
            StoreConfig::default(),
        );
        Harness { backend, clock, store }
    }

    fn harness() -> Harness {
        harness_with(EntityRegistry::rockhounding().unwrap())
    }

    fn session() -> Value {
        json!({"name": "Quarry ridge", "started_at": 1000})
    }

    /// Simulates a confirmed sync of the entity's current state.
    fn sync(h: &Harness, entity: &CachedEntity, remote_id: &str) -> CachedEntity {
        let entry = h.store.lock(entity.entity_ref());
        let mut current = entry.read().unwrap().unwrap();
        current.remote_id = Some(remote_id.into());
        let snapshot = current.payload.clone();
        let at = current.metadata.updated_at;
        current.metadata.mark_synced(at, 1, snapshot);
        entry.write(&mut current, ChangeSource::Remote).unwrap();
        current
    }

    #[test]
    fn put_get_roundtrip() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        assert!(created.is_dirty());
        assert!(created.remote_id.is_none());
        assert_eq!(created.metadata.created_at, 1_000);

        let read = h
            .store
            .get(EntityType::FieldSession, created.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(read, created);
    }

    #[test]
    fn put_rejects_invalid_payload() {
        let h = harness();
        let err = h
            .store
            .insert(EntityType::FieldSession, json!({"name": "no start"}))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(h.backend.row_count(), 0);
    }

    #[test]
    fn update_keeps_identity_and_advances_time() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        h.clock.advance(Duration::from_secs(1));
        let updated = h
            .store
            .put(
                EntityType::FieldSession,
                created.local_id,
                json!({"name": "Quarry ridge", "started_at": 1000, "notes": "windy"}),
            )
            .unwrap();
        assert_eq!(updated.metadata.created_at, 1_000);
        assert_eq!(updated.metadata.updated_at, 2_000);
        assert_ne!(updated.metadata.checksum, created.metadata.checksum);
    }

    #[test]
    fn delete_without_remote_id_removes() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        assert_eq!(
            h.store.delete(EntityType::FieldSession, created.local_id).unwrap(),
            DeleteOutcome::Removed
        );
        assert!(h.store.get(EntityType::FieldSession, created.local_id).unwrap().is_none());
        assert!(matches!(
            h.store.delete(EntityType::FieldSession, created.local_id),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_with_remote_id_tombstones() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &created, "rs-1");

        assert_eq!(
            h.store.delete(EntityType::FieldSession, created.local_id).unwrap(),
            DeleteOutcome::Tombstoned
        );
        assert!(h.store.get(EntityType::FieldSession, created.local_id).unwrap().is_none());
        let tomb = h
            .store
            .lock(created.entity_ref())
            .read()
            .unwrap()
            .unwrap();
        assert!(tomb.is_deleted());
        assert!(tomb.is_dirty());

        let err = h
            .store
            .put(EntityType::FieldSession, created.local_id, session())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn put_refuses_references_to_missing_parents() {
        let h = harness();
        let log = |session: LocalId| json!({"session_id": session.to_string()});

        let err = h.store.insert(EntityType::FindLog, log(LocalId::new())).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let parent = h.store.insert(EntityType::FieldSession, session()).unwrap();
        let child = h.store.insert(EntityType::FindLog, log(parent.local_id)).unwrap();

        // evicted after sync: still resolvable through the id mapping
        sync(&h, &parent, "rs-1");
        h.store.run_eviction(0).unwrap();
        assert!(h.store.is_referenceable(parent.entity_ref()).unwrap());
        h.store.insert(EntityType::FindLog, log(parent.local_id)).unwrap();

        // gone for good: the existing child may still be edited but not repointed
        h.store.lock(parent.entity_ref()).remove(None).unwrap();
        assert!(!h.store.is_referenceable(parent.entity_ref()).unwrap());
        h.store
            .put(
                EntityType::FindLog,
                child.local_id,
                json!({"session_id": parent.local_id.to_string(), "notes": "edited"}),
            )
            .unwrap();
        assert!(h.store.insert(EntityType::FindLog, log(parent.local_id)).is_err());
    }

    #[test]
    fn tombstoned_parent_takes_no_new_children() {
        let h = harness();
        let parent = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &parent, "rs-2");
        h.store.delete(EntityType::FieldSession, parent.local_id).unwrap();

        let err = h
            .store
            .insert(EntityType::FindLog, json!({"session_id": parent.local_id.to_string()}))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn list_returns_live_entities_in_key_order() {
        let h = harness();
        let a = h.store.insert(EntityType::FieldSession, session()).unwrap();
        let b = h.store.insert(EntityType::FieldSession, session()).unwrap();
        h.store
            .insert(EntityType::Telemetry, json!({"event": "app_open"}))
            .unwrap();

        let listed = h.store.list(EntityType::FieldSession).unwrap();
        let mut expected = vec![a.local_id, b.local_id];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(listed.iter().map(|e| e.local_id).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn remote_index_tracks_remote_ids() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        assert!(h
            .store
            .find_by_remote_id(EntityType::FieldSession, "rs-9")
            .unwrap()
            .is_none());
        sync(&h, &created, "rs-9");
        assert_eq!(
            h.store.find_by_remote_id(EntityType::FieldSession, "rs-9").unwrap(),
            Some(created.local_id)
        );
        h.store.lock(created.entity_ref()).remove(None).unwrap();
        assert!(h
            .store
            .find_by_remote_id(EntityType::FieldSession, "rs-9")
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupted_payload_is_quarantined() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &created, "rs-1");

        let table = EntityType::FieldSession.table_name();
        assert!(h.backend.tamper(&table, &created.entity_ref().key(), |bytes| {
            let pos = bytes.windows(6).position(|w| w == b"Quarry").unwrap();
            bytes[pos] = b'q';
        }));

        let err = h
            .store
            .get(EntityType::FieldSession, created.local_id)
            .unwrap_err();
        assert!(err.is_corruption());

        let quarantined = h.store.quarantined().unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].entity, created.entity_ref());
        assert_eq!(quarantined[0].remote_id.as_deref(), Some("rs-1"));

        assert!(h.store.list(EntityType::FieldSession).unwrap().is_empty());
        assert!(h.store.clear_quarantine(created.entity_ref()).unwrap());
    }

    #[test]
    fn entities_and_indexes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(EntityRegistry::rockhounding().unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let open = || {
            let backend = Arc::new(geode_storage::FileBackend::open(dir.path()).unwrap());
            LocalStore::new(backend, registry.clone(), clock.clone(), StoreConfig::default())
        };

        let (synced, pending) = {
            let store = open();
            let synced = store.insert(EntityType::FieldSession, session()).unwrap();
            let entry = store.lock(synced.entity_ref());
            let mut current = entry.read().unwrap().unwrap();
            current.remote_id = Some("rs-7".into());
            let snapshot = current.payload.clone();
            current.metadata.mark_synced(current.metadata.updated_at, 3, snapshot);
            entry.write(&mut current, ChangeSource::Remote).unwrap();
            drop(entry);
            let pending = store.insert(EntityType::FieldSession, session()).unwrap();
            store.flush().unwrap();
            (current, pending)
        };

        let store = open();
        let read = store.get(EntityType::FieldSession, synced.local_id).unwrap().unwrap();
        assert_eq!(read.metadata.remote_version, Some(3));
        assert!(!read.is_dirty());
        assert!(store.get(EntityType::FieldSession, pending.local_id).unwrap().unwrap().is_dirty());
        assert_eq!(
            store.find_by_remote_id(EntityType::FieldSession, "rs-7").unwrap(),
            Some(synced.local_id)
        );
    }

    #[test]
    fn undecodable_record_is_quarantined() {
        let h = harness();
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        let table = EntityType::FieldSession.table_name();
        h.backend.tamper(&table, &created.entity_ref().key(), |bytes| bytes.truncate(3));

        assert!(h
            .store
            .get(EntityType::FieldSession, created.local_id)
            .unwrap_err()
            .is_corruption());
        let quarantined = h.store.quarantined().unwrap();
        assert_eq!(quarantined[0].remote_id, None);
    }

    #[test]
    fn pinned_and_dirty_entries_survive_eviction() {
        let h = harness();
        let dirty = h.store.insert(EntityType::FieldSession, session()).unwrap();
        let pinned = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &pinned, "rs-p");
        h.store.pin(EntityType::FieldSession, pinned.local_id).unwrap();

        let err = h.store.run_eviction(0).unwrap_err();
        assert!(matches!(err, CoreError::StorageExhausted { evicted: 0, .. }));
        assert!(h.store.get(EntityType::FieldSession, dirty.local_id).unwrap().is_some());
        assert!(h.store.get(EntityType::FieldSession, pinned.local_id).unwrap().is_some());

        h.store.unpin(EntityType::FieldSession, pinned.local_id).unwrap();
        h.store.delete(EntityType::FieldSession, dirty.local_id).unwrap();
        let report = h.store.run_eviction(0).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.used_bytes, 0);
    }

    #[test]
    fn eviction_order_prefers_expiring_then_oldest() {
        let registry = RegistryBuilder::rockhounding()
            .ttl(EntityType::Telemetry, Some(Duration::from_secs(60)))
            .build()
            .unwrap();
        let h = harness_with(registry);

        let old_session = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &old_session, "rs-old");
        h.clock.advance(Duration::from_secs(10));
        let new_session = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &new_session, "rs-new");
        let telemetry = h
            .store
            .insert(EntityType::Telemetry, json!({"event": "map_open"}))
            .unwrap();
        let telemetry = sync(&h, &telemetry, "rt-1");

        let total = h.store.total_size().unwrap();
        let budget = total - telemetry.metadata.size_bytes;
        let report = h.store.run_eviction(budget).unwrap();

        // the TTL entry goes first even though it is newest
        assert_eq!(report.evicted, 1);
        assert!(h.store.get(EntityType::Telemetry, telemetry.local_id).unwrap().is_none());
        assert!(h.store.get(EntityType::FieldSession, old_session.local_id).unwrap().is_some());

        let report = h.store.run_eviction(report.used_bytes - 1).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(h.store.get(EntityType::FieldSession, old_session.local_id).unwrap().is_none());
        assert!(h.store.get(EntityType::FieldSession, new_session.local_id).unwrap().is_some());
    }

    #[test]
    fn eviction_keeps_id_mappings() {
        let h = harness();
        let parent = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &parent, "rs-9");
        h.store.run_eviction(0).unwrap();

        assert!(h.store.get(EntityType::FieldSession, parent.local_id).unwrap().is_none());
        assert_eq!(h.store.remote_id_of(parent.entity_ref()).unwrap().as_deref(), Some("rs-9"));
        assert_eq!(
            h.store.find_by_remote_id(EntityType::FieldSession, "rs-9").unwrap(),
            Some(parent.local_id)
        );
    }

    #[test]
    fn remove_drops_id_mappings() {
        let h = harness();
        let entity = h.store.insert(EntityType::FieldSession, session()).unwrap();
        sync(&h, &entity, "rs-3");
        h.store.lock(entity.entity_ref()).remove(None).unwrap();

        assert!(h.store.remote_id_of(entity.entity_ref()).unwrap().is_none());
        assert!(h.store.find_by_remote_id(EntityType::FieldSession, "rs-3").unwrap().is_none());
    }

    #[test]
    fn purge_expired_removes_only_clean_expired() {
        let h = harness();
        let clean = h
            .store
            .insert(EntityType::Telemetry, json!({"event": "a"}))
            .unwrap();
        sync(&h, &clean, "rt-a");
        let dirty = h
            .store
            .insert(EntityType::Telemetry, json!({"event": "b"}))
            .unwrap();

        assert_eq!(h.store.purge_expired().unwrap(), 0);
        h.clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(h.store.purge_expired().unwrap(), 1);
        assert!(h.store.get(EntityType::Telemetry, clean.local_id).unwrap().is_none());
        assert!(h.store.get(EntityType::Telemetry, dirty.local_id).unwrap().is_some());
    }

    fn v2_registry() -> EntityRegistry {
        let mut table = MigrationTable::new();
        table
            .register(MigrationStep::new(
                1,
                "rename_label",
                MigrationKind::RenameField {
                    from: "label".into(),
                    to: "event".into(),
                },
            ))
            .unwrap();
        RegistryBuilder::rockhounding()
            .register(
                EntityType::Telemetry,
                EntityTypeConfig::new(EntitySchema::new().required("event", FieldKind::String), 10)
                    .with_migrations(2, table),
            )
            .build()
            .unwrap()
    }

    fn v1_registry() -> EntityRegistry {
        RegistryBuilder::rockhounding()
            .register(
                EntityType::Telemetry,
                EntityTypeConfig::new(EntitySchema::new().required("label", FieldKind::String), 10),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn old_records_migrate_on_read() {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(1));
        let old = LocalStore::new(backend.clone(), Arc::new(v1_registry()), clock.clone(), StoreConfig::default());
        let created = old
            .insert(EntityType::Telemetry, json!({"label": "app_open"}))
            .unwrap();
        drop(old);

        let store = LocalStore::new(backend, Arc::new(v2_registry()), clock, StoreConfig::default());
        let migrations = store.feed().subscribe(Some(ChangeSource::Migration));
        let read = store
            .get(EntityType::Telemetry, created.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(read.payload, json!({"event": "app_open"}));
        assert_eq!(read.metadata.schema_version, 2);
        assert!(read.is_dirty());
        assert_eq!(migrations.try_recv().unwrap().changed_ids, vec![created.local_id]);

        // rewritten, so the second read does not migrate again
        store.get(EntityType::Telemetry, created.local_id).unwrap();
        assert!(migrations.try_recv().is_err());
    }

    #[test]
    fn migrate_all_upgrades_everything() {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(1));
        let old = LocalStore::new(backend.clone(), Arc::new(v1_registry()), clock.clone(), StoreConfig::default());
        for i in 0..3 {
            old.insert(EntityType::Telemetry, json!({"label": format!("e{i}")}))
                .unwrap();
        }
        drop(old);

        let store = LocalStore::new(backend, Arc::new(v2_registry()), clock, StoreConfig::default());
        let report = store.migrate_all().unwrap();
        assert_eq!(report.migrated, 3);
        assert!(report.failed.is_empty());
        assert_eq!(store.migrate_all().unwrap().migrated, 0);
    }

    #[test]
    fn failed_migration_leaves_record_untouched() {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(1));
        let old = LocalStore::new(
            backend.clone(),
            Arc::new(RegistryBuilder::rockhounding().build().unwrap()),
            clock.clone(),
            StoreConfig::default(),
        );
        // the step drops a field the v2 schema requires
        let created = old
            .insert(EntityType::Telemetry, json!({"event": "x"}))
            .unwrap();
        drop(old);

        let mut table = MigrationTable::new();
        table
            .register(MigrationStep::new(
                1,
                "drop_event",
                MigrationKind::RemoveField { name: "event".into() },
            ))
            .unwrap();
        let registry = RegistryBuilder::rockhounding()
            .register(
                EntityType::Telemetry,
                EntityTypeConfig::new(EntitySchema::new().required("event", FieldKind::String), 10)
                    .with_migrations(2, table),
            )
            .build()
            .unwrap();
        let store = LocalStore::new(backend.clone(), Arc::new(registry), clock, StoreConfig::default());

        let err = store.get(EntityType::Telemetry, created.local_id).unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
        let bytes = backend
            .get(&EntityType::Telemetry.table_name(), &created.entity_ref().key())
            .unwrap()
            .unwrap();
        assert_eq!(metadata::peek(&bytes).unwrap().1.schema_version, 1);
    }

    #[test]
    fn local_changes_are_announced() {
        let h = harness();
        let local = h.store.feed().subscribe(Some(ChangeSource::Local));
        let created = h.store.insert(EntityType::FieldSession, session()).unwrap();
        h.store.delete(EntityType::FieldSession, created.local_id).unwrap();

        assert_eq!(local.try_recv().unwrap().changed_ids, vec![created.local_id]);
        assert_eq!(local.try_recv().unwrap().source, ChangeSource::Local);
    }

    #[test]
    fn write_refuses_other_entity() {
        let h = harness();
        let a = h.store.insert(EntityType::FieldSession, session()).unwrap();
        let mut b = h.store.insert(EntityType::FieldSession, session()).unwrap();
        let entry = h.store.lock(a.entity_ref());
        assert!(entry.write(&mut b, ChangeSource::Local).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Create,
            Edit(usize),
            Sync(usize),
            Pin(usize),
            Evict(u64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Create),
                (0usize..8).prop_map(Op::Edit),
                (0usize..8).prop_map(Op::Sync),
                (0usize..8).prop_map(Op::Pin),
                (0u64..2_000).prop_map(Op::Evict),
            ]
        }

        proptest! {
            #[test]
            fn eviction_never_drops_unsynced_or_pinned(ops in prop::collection::vec(op_strategy(), 1..40)) {
                let h = harness();
                let mut ids: Vec<LocalId> = Vec::new();
                let mut counter = 0u64;

                for op in ops {
                    h.clock.advance(Duration::from_millis(10));
                    match op {
                        Op::Create => {
                            counter += 1;
                            let e = h.store.insert(
                                EntityType::FieldSession,
                                json!({"name": format!("s{counter}"), "started_at": counter}),
                            ).unwrap();
                            ids.push(e.local_id);
                        }
                        Op::Edit(i) if !ids.is_empty() => {
                            let id = ids[i % ids.len()];
                            counter += 1;
                            if h.store.get(EntityType::FieldSession, id).unwrap().is_some() {
                                h.store.put(
                                    EntityType::FieldSession,
                                    id,
                                    json!({"name": format!("e{counter}"), "started_at": counter}),
                                ).unwrap();
                            }
                        }
                        Op::Sync(i) if !ids.is_empty() => {
                            let id = ids[i % ids.len()];
                            if let Some(e) = h.store.get(EntityType::FieldSession, id).unwrap() {
                                sync(&h, &e, &format!("r-{id}"));
                            }
                        }
                        Op::Pin(i) if !ids.is_empty() => {
                            let id = ids[i % ids.len()];
                            if h.store.get(EntityType::FieldSession, id).unwrap().is_some() {
                                h.store.pin(EntityType::FieldSession, id).unwrap();
                            }
                        }
                        Op::Evict(budget) => {
                            let before: Vec<CachedEntity> = h.store.list(EntityType::FieldSession).unwrap();
                            let _ = h.store.run_eviction(budget);
                            for e in before {
                                if e.is_dirty() || e.metadata.pinned || e.remote_id.is_none() {
                                    let after = h.store.get(EntityType::FieldSession, e.local_id).unwrap();
                                    prop_assert_eq!(after, Some(e));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
