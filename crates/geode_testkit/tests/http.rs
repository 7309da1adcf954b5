//! The engine over the HTTP transport, with CBOR bodies on the wire.

use geode_core::ManualClock;
use geode_storage::InMemoryBackend;
use geode_sync_engine::{HttpTransport, LoopbackClient, SyncEngine};
use geode_testkit::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type HttpEngine = SyncEngine<HttpTransport<LoopbackClient<LoopbackRemote>>>;

struct Setup {
    engine: HttpEngine,
    remote: Arc<RemoteSimulator>,
    clock: Arc<ManualClock>,
    backend: Arc<InMemoryBackend>,
}

fn setup() -> Setup {
    let clock = Arc::new(ManualClock::new(TEST_EPOCH_MS));
    let remote = Arc::new(RemoteSimulator::new(clock.clone()));
    let backend = Arc::new(InMemoryBackend::new());
    let transport = HttpTransport::new(
        "https://sync.geode.test/",
        LoopbackClient::new(LoopbackRemote(remote.clone())),
    );
    let engine = SyncEngine::open(
        test_config(),
        backend.clone(),
        Arc::new(standard_registry()),
        clock.clone(),
        Arc::new(transport),
    )
    .unwrap();
    Setup {
        engine,
        remote,
        clock,
        backend,
    }
}

#[test]
fn entity_tree_syncs_over_http() {
    init_tracing();
    let s = setup();
    let session = s.engine.create(EntityType::FieldSession, sample_session("Graveyard Point")).unwrap();
    let log = s.engine.create(EntityType::FindLog, find_log(&session, "plume agate")).unwrap();
    let spec = s.engine.create(EntityType::Specimen, specimen(&log, "agate")).unwrap();

    let report = s.engine.sync_cycle().unwrap();
    assert_eq!(report.accepted, 3);
    assert_eq!(s.engine.pending_count(), 0);

    let log_remote = s.engine.store().remote_id_of(log.entity_ref()).unwrap().unwrap();
    let spec_remote = s.engine.store().remote_id_of(spec.entity_ref()).unwrap().unwrap();
    let stored = s.remote.record(&spec_remote).unwrap().payload.unwrap();
    assert_eq!(stored["find_log_remote_id"], json!(log_remote));
    assert!(s.remote.order_violations().is_empty());
}

#[test]
fn lost_response_over_http_is_replayed() {
    let s = setup();
    s.engine.create(EntityType::FieldSession, sample_session("Timeout")).unwrap();
    s.remote.lose_next_responses(1);

    assert!(matches!(s.engine.sync_cycle(), Err(SyncError::Timeout)));
    s.clock.advance(Duration::from_secs(60));
    s.engine.sync_cycle().unwrap();

    assert_eq!(s.remote.replayed_count(), 1);
    assert_eq!(s.remote.live_records(EntityType::FieldSession).len(), 1);
}

#[test]
fn unreachable_remote_means_offline() {
    let s = setup();
    s.engine.create(EntityType::FieldSession, sample_session("Canyon floor")).unwrap();
    s.remote.set_connected(false);

    assert!(matches!(s.engine.sync_cycle(), Err(SyncError::NotConnected)));
    assert_eq!(s.engine.state(), SyncState::Offline);
    assert_eq!(s.engine.pending_entries()[0].attempt, 0);

    s.remote.set_connected(true);
    s.engine.sync_cycle().unwrap();
    assert_eq!(s.engine.pending_count(), 0);
}

#[test]
fn corrupted_record_is_refetched_over_http() {
    let s = setup();
    let session = s.engine.create(EntityType::FieldSession, sample_session("Owyhee")).unwrap();
    s.engine.sync_cycle().unwrap();

    let table = EntityType::FieldSession.table_name();
    assert!(s.backend.tamper(&table, &session.entity_ref().key(), |bytes| {
        if let Some(pos) = bytes.windows(6).position(|w| w == b"Owyhee") {
            bytes[pos] = b'o';
        }
    }));
    assert!(s.engine.get(EntityType::FieldSession, session.local_id).is_err());

    let report = s.engine.sync_cycle().unwrap();
    assert_eq!(report.repaired, 1);
    let repaired = s.engine.get(EntityType::FieldSession, session.local_id).unwrap().unwrap();
    assert_eq!(repaired.payload, sample_session("Owyhee"));
}
