//! Test fixtures and engine helpers.
//!
//! [`TestEngine`] wires a [`SyncEngine`] to a [`RemoteSimulator`] and a
//! [`ManualClock`], over either an in-memory or an on-disk backend.

use crate::remote::RemoteSimulator;
use geode_core::{CachedEntity, Clock, EntityRegistry, EntityType, ManualClock};
use geode_storage::{FileBackend, InMemoryBackend, TableBackend};
use geode_sync_engine::{RetryConfig, SyncConfig, SyncCycleReport, SyncEngine};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Start time of every test clock (ms since epoch).
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// Installs a tracing subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A field session payload.
pub fn sample_session(name: &str) -> Value {
    json!({"name": name, "started_at": TEST_EPOCH_MS})
}

/// A find log payload attached to `session`.
pub fn find_log(session: &CachedEntity, notes: &str) -> Value {
    json!({
        "session_id": session.local_id.to_string(),
        "location": {"lat": 44.06, "lng": -121.31},
        "notes": notes,
    })
}

/// A specimen payload attached to `find_log`.
pub fn specimen(find_log: &CachedEntity, mineral: &str) -> Value {
    json!({
        "find_log_id": find_log.local_id.to_string(),
        "mineral": mineral,
        "weight_g": 12.5,
        "tags": ["field"],
    })
}

/// A capture payload attached to `specimen`.
pub fn capture(specimen: &CachedEntity, image_ref: &str) -> Value {
    json!({
        "specimen_id": specimen.local_id.to_string(),
        "image_ref": image_ref,
        "stage": "captured",
    })
}

/// Default configuration for tests: no jitter, so back-off is predictable.
pub fn test_config() -> SyncConfig {
    SyncConfig::default().with_retry(RetryConfig::new(5).with_jitter(false))
}

/// A sync engine connected to a [`RemoteSimulator`].
pub struct TestEngine {
    /// The engine under test.
    pub engine: SyncEngine<RemoteSimulator>,
    /// The simulated remote.
    pub remote: Arc<RemoteSimulator>,
    /// The shared clock.
    pub clock: Arc<ManualClock>,
    /// The backend the engine was opened over.
    pub backend: Arc<dyn TableBackend>,
    config: SyncConfig,
    registry: Arc<EntityRegistry>,
    dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an in-memory engine with the standard registry.
    pub fn memory() -> Self {
        Self::memory_with(test_config(), standard_registry())
    }

    /// Creates an in-memory engine with the given configuration and registry.
    pub fn memory_with(config: SyncConfig, registry: EntityRegistry) -> Self {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let remote = Arc::new(RemoteSimulator::new(clock.clone()));
        let backend: Arc<dyn TableBackend> = Arc::new(InMemoryBackend::new());
        Self::assemble(config, Arc::new(registry), clock, remote, backend, None)
    }

    /// Creates an engine over a file backend in a fresh temporary directory.
    pub fn on_disk() -> Self {
        let dir = TempDir::new().expect("failed to create temp directory");
        let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
        let remote = Arc::new(RemoteSimulator::new(clock.clone()));
        let backend = open_file_backend(dir.path());
        Self::assemble(test_config(), Arc::new(standard_registry()), clock, remote, backend, Some(dir))
    }

    /// Simulates a process restart: drops the engine and reopens the same
    /// storage, keeping the remote and the clock.
    ///
    /// # Panics
    ///
    /// Panics for in-memory engines, whose state would not survive.
    pub fn restart(self) -> Self {
        let Self {
            engine,
            remote,
            clock,
            backend,
            config,
            registry,
            dir,
        } = self;
        let dir = dir.expect("only on-disk engines can restart");
        drop(engine);
        drop(backend);
        let backend = open_file_backend(dir.path());
        Self::assemble(config, registry, clock, remote, backend, Some(dir))
    }

    /// Returns the storage directory of an on-disk engine.
    pub fn path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Runs sync cycles until the queue is empty or `max_cycles` ran,
    /// advancing the clock past any back-off in between.
    ///
    /// Returns the reports of the cycles that completed.
    pub fn sync_until_idle(&self, max_cycles: usize) -> Vec<SyncCycleReport> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            if let Ok(report) = self.engine.sync_cycle() {
                reports.push(report);
            }
            if self.engine.pending_count() == 0 {
                break;
            }
            self.clock.advance(Duration::from_secs(600));
        }
        reports
    }

    /// Returns the entity's remote id as the store currently knows it.
    pub fn remote_id_of(&self, entity: &CachedEntity) -> Option<String> {
        self.engine
            .store()
            .remote_id_of(entity.entity_ref())
            .expect("failed to read id mapping")
    }

    /// Returns the stored entity, tombstones included.
    pub fn raw(&self, entity: &CachedEntity) -> Option<CachedEntity> {
        self.engine
            .store()
            .lock(entity.entity_ref())
            .read()
            .expect("failed to read entity")
    }

    /// Returns the current time of the test clock.
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn assemble(
        config: SyncConfig,
        registry: Arc<EntityRegistry>,
        clock: Arc<ManualClock>,
        remote: Arc<RemoteSimulator>,
        backend: Arc<dyn TableBackend>,
        dir: Option<TempDir>,
    ) -> Self {
        let engine = SyncEngine::open(config.clone(), backend.clone(), registry.clone(), clock.clone(), remote.clone())
            .expect("failed to open sync engine");
        Self {
            engine,
            remote,
            clock,
            backend,
            config,
            registry,
            dir,
        }
    }
}

impl std::ops::Deref for TestEngine {
    type Target = SyncEngine<RemoteSimulator>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Returns the standard rockhounding registry.
pub fn standard_registry() -> EntityRegistry {
    EntityRegistry::rockhounding().expect("standard registry is valid")
}

fn open_file_backend(path: &Path) -> Arc<dyn TableBackend> {
    Arc::new(FileBackend::open(path).expect("failed to open file backend"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geode_core::ChangeSource;

    #[test]
    fn fixtures_validate_against_registry() {
        let t = TestEngine::memory();
        let session = t.create(EntityType::FieldSession, sample_session("Ridge")).unwrap();
        let log = t.create(EntityType::FindLog, find_log(&session, "creek bed")).unwrap();
        let spec = t.create(EntityType::Specimen, specimen(&log, "agate")).unwrap();
        t.create(EntityType::Capture, capture(&spec, "img-1")).unwrap();
        assert_eq!(t.pending_count(), 4);
    }

    #[test]
    fn sync_until_idle_drains_queue() {
        init_tracing();
        let t = TestEngine::memory();
        let changes = t.subscribe(Some(ChangeSource::Remote));
        let session = t.create(EntityType::FieldSession, sample_session("Ridge")).unwrap();
        t.sync_until_idle(3);
        assert_eq!(t.pending_count(), 0);
        assert!(t.remote_id_of(&session).is_some());
        assert!(changes.try_recv().is_ok());
    }

    #[test]
    fn restart_keeps_pending_work() {
        let t = TestEngine::on_disk();
        t.create(EntityType::FieldSession, sample_session("Ridge")).unwrap();
        let t = t.restart();
        assert_eq!(t.pending_count(), 1);
    }
}
