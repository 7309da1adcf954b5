//! In-process remote backend.
//!
//! [`RemoteSimulator`] behaves like the real sync endpoint closely enough to
//! exercise the engine end to end:
//!
//! - every record carries a version; updates and deletes whose baseline does
//!   not match the current version come back as conflicts
//! - item results are remembered by idempotency key, so a replayed operation
//!   gets the original answer and is applied once
//! - a `*_remote_id` field naming an unknown parent is refused and recorded as
//!   an ordering violation
//!
//! Faults can be injected: whole-batch failures, responses lost after the
//! batch was applied, rejection rules and lost connectivity.

use geode_core::{Clock, EntityType};
use geode_sync_engine::{HttpFailure, LoopbackServer, RemoteChange, SyncError, SyncResult, SyncTransport};
use geode_sync_protocol::{
    BatchRequest, BatchResponse, DeltaPayload, FetchRequest, FetchResponse, ItemOutcome, ItemResult, OperationType,
    SyncOperation,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Suffix of payload fields that reference a parent by remote id.
pub const REMOTE_REF_SUFFIX: &str = "_remote_id";

/// A record held by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Entity type name.
    pub entity_type: String,
    /// Remote id.
    pub remote_id: String,
    /// Local id of the client that created it, if created through a batch.
    pub entity_id: Option<String>,
    /// Current version.
    pub version: u64,
    /// Current payload; `None` once deleted.
    pub payload: Option<Value>,
    /// Last modification time (ms since epoch).
    pub updated_at: u64,
}

impl RemoteRecord {
    /// Returns true unless the record was deleted.
    pub fn is_live(&self) -> bool {
        self.payload.is_some()
    }
}

type RejectRule = Box<dyn Fn(&SyncOperation) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct RemoteState {
    records: BTreeMap<String, RemoteRecord>,
    applied: HashMap<String, ItemOutcome>,
    next_id: u64,
    batches: Vec<BatchRequest>,
    replayed: usize,
    order_violations: Vec<String>,
    batch_failures: VecDeque<SyncError>,
    lost_responses: u32,
    crash_after_apply: bool,
}

/// An in-process remote backend implementing [`SyncTransport`].
pub struct RemoteSimulator {
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    state: Mutex<RemoteState>,
    rules: Mutex<Vec<RejectRule>>,
}

impl RemoteSimulator {
    /// Creates an empty remote that stamps its own edits with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            connected: AtomicBool::new(true),
            state: Mutex::new(RemoteState::default()),
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fails the next batch with `error` before anything is applied.
    pub fn fail_next_batch(&self, error: SyncError) {
        self.state.lock().batch_failures.push_back(error);
    }

    /// Applies the next `count` batches but answers them with a timeout.
    pub fn lose_next_responses(&self, count: u32) {
        self.state.lock().lost_responses += count;
    }

    /// Applies the next batch, then panics inside the call.
    ///
    /// Models the client process dying while the batch is on the wire; catch
    /// the panic and restart the engine to observe recovery.
    pub fn crash_after_next_apply(&self) {
        self.state.lock().crash_after_apply = true;
    }

    /// Rejects every item for which `rule` returns a reason.
    pub fn reject_when<F>(&self, rule: F)
    where
        F: Fn(&SyncOperation) -> Option<String> + Send + Sync + 'static,
    {
        self.rules.lock().push(Box::new(rule));
    }

    /// Removes every rejection rule.
    pub fn clear_rules(&self) {
        self.rules.lock().clear();
    }

    /// Returns a record by remote id.
    pub fn record(&self, remote_id: &str) -> Option<RemoteRecord> {
        self.state.lock().records.get(remote_id).cloned()
    }

    /// Returns the live record created from the given local id.
    pub fn record_by_entity_id(&self, entity_id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .records
            .values()
            .find(|r| r.is_live() && r.entity_id.as_deref() == Some(entity_id))
            .cloned()
    }

    /// Returns the live records of a type.
    pub fn live_records(&self, entity_type: EntityType) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.entity_type == entity_type.as_str() && r.is_live())
            .cloned()
            .collect()
    }

    /// Returns every batch received, including failed ones.
    pub fn batches(&self) -> Vec<BatchRequest> {
        self.state.lock().batches.clone()
    }

    /// Returns every item received, in arrival order.
    pub fn received_items(&self) -> Vec<SyncOperation> {
        self.state
            .lock()
            .batches
            .iter()
            .flat_map(|b| b.items.iter().cloned())
            .collect()
    }

    /// Returns the number of distinct operations applied.
    pub fn applied_count(&self) -> usize {
        self.state.lock().applied.len()
    }

    /// Returns the number of items answered from the idempotency cache.
    pub fn replayed_count(&self) -> usize {
        self.state.lock().replayed
    }

    /// Returns the items that referenced a parent the remote did not hold.
    pub fn order_violations(&self) -> Vec<String> {
        self.state.lock().order_violations.clone()
    }

    /// Creates a record as another device would.
    pub fn remote_create(&self, entity_type: EntityType, payload: Value) -> RemoteChange {
        let mut state = self.state.lock();
        let remote_id = next_remote_id(&mut state);
        let updated_at = self.clock.now_ms();
        state.records.insert(
            remote_id.clone(),
            RemoteRecord {
                entity_type: entity_type.as_str().to_string(),
                remote_id: remote_id.clone(),
                entity_id: None,
                version: 1,
                payload: Some(payload.clone()),
                updated_at,
            },
        );
        RemoteChange {
            entity_type,
            remote_id,
            version: 1,
            payload: Some(payload),
            updated_at,
        }
    }

    /// Registers a record for a client entity, as if another device had
    /// already created it under the same local id.
    ///
    /// The client's own create then comes back as a conflict. Returns the
    /// remote id.
    pub fn claim(&self, entity_type: EntityType, entity_id: &str, payload: Value) -> String {
        let mut state = self.state.lock();
        let remote_id = next_remote_id(&mut state);
        let updated_at = self.clock.now_ms();
        state.records.insert(
            remote_id.clone(),
            RemoteRecord {
                entity_type: entity_type.as_str().to_string(),
                remote_id: remote_id.clone(),
                entity_id: Some(entity_id.to_string()),
                version: 1,
                payload: Some(payload),
                updated_at,
            },
        );
        remote_id
    }

    /// Edits a record as another device would.
    ///
    /// `patch` is merged field by field; a null value removes the field.
    /// Returns `None` if the record is unknown or deleted.
    pub fn remote_edit(&self, remote_id: &str, patch: Value) -> Option<RemoteChange> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let record = state.records.get_mut(remote_id)?;
        let Some(Value::Object(fields)) = record.payload.as_mut() else {
            return None;
        };
        if let Value::Object(patch) = patch {
            for (name, value) in patch {
                if value.is_null() {
                    fields.remove(&name);
                } else {
                    fields.insert(name, value);
                }
            }
        }
        record.version += 1;
        record.updated_at = now;
        change_for(record)
    }

    /// Deletes a record as another device would.
    pub fn remote_delete(&self, remote_id: &str) -> Option<RemoteChange> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let record = state.records.get_mut(remote_id)?;
        record.payload = None;
        record.version += 1;
        record.updated_at = now;
        change_for(record)
    }

    fn apply(&self, state: &mut RemoteState, item: &SyncOperation) -> ItemOutcome {
        for rule in self.rules.lock().iter() {
            if let Some(reason) = rule(item) {
                return ItemOutcome::Rejected { reason };
            }
        }

        for (name, value) in written_fields(&item.delta_payload) {
            if !name.ends_with(REMOTE_REF_SUFFIX) {
                continue;
            }
            let known = value
                .as_str()
                .and_then(|id| state.records.get(id))
                .is_some_and(RemoteRecord::is_live);
            if !known {
                state
                    .order_violations
                    .push(format!("{}:{} references {name}={value}", item.entity_type, item.entity_id));
                return ItemOutcome::Rejected {
                    reason: format!("unknown parent in {name}"),
                };
            }
        }

        match item.operation {
            OperationType::Create => {
                let DeltaPayload::Full(payload) = &item.delta_payload else {
                    return ItemOutcome::Rejected {
                        reason: "create needs a full payload".into(),
                    };
                };
                let existing = state
                    .records
                    .values()
                    .find(|r| {
                        r.is_live() && r.entity_type == item.entity_type && r.entity_id.as_deref() == Some(item.entity_id.as_str())
                    });
                if let Some(record) = existing {
                    return ItemOutcome::Conflict {
                        remote_id: Some(record.remote_id.clone()),
                        remote_version: record.version,
                        remote_payload: record.payload.clone(),
                        remote_updated_at: record.updated_at,
                    };
                }
                let remote_id = next_remote_id(state);
                state.records.insert(
                    remote_id.clone(),
                    RemoteRecord {
                        entity_type: item.entity_type.clone(),
                        remote_id: remote_id.clone(),
                        entity_id: Some(item.entity_id.clone()),
                        version: 1,
                        payload: Some(payload.clone()),
                        updated_at: item.updated_at,
                    },
                );
                ItemOutcome::Accepted { remote_id, version: 1 }
            }
            OperationType::Update | OperationType::Delete => {
                let Some(record) = item.remote_id.as_deref().and_then(|id| state.records.get_mut(id)) else {
                    return ItemOutcome::Rejected {
                        reason: "unknown entity".into(),
                    };
                };
                let delete = item.operation == OperationType::Delete;
                if delete && !record.is_live() {
                    return ItemOutcome::Accepted {
                        remote_id: record.remote_id.clone(),
                        version: record.version,
                    };
                }
                if !record.is_live() || item.baseline_version != Some(record.version) {
                    return ItemOutcome::Conflict {
                        remote_id: Some(record.remote_id.clone()),
                        remote_version: record.version,
                        remote_payload: record.payload.clone(),
                        remote_updated_at: record.updated_at,
                    };
                }
                if delete {
                    record.payload = None;
                } else {
                    match &item.delta_payload {
                        DeltaPayload::Full(payload) => record.payload = Some(payload.clone()),
                        DeltaPayload::Fields(delta) => {
                            if let Some(payload) = record.payload.as_mut() {
                                delta.apply_to(payload);
                            }
                        }
                        DeltaPayload::Identifier => {}
                    }
                }
                record.version += 1;
                record.updated_at = item.updated_at;
                ItemOutcome::Accepted {
                    remote_id: record.remote_id.clone(),
                    version: record.version,
                }
            }
        }
    }
}

impl SyncTransport for RemoteSimulator {
    fn send_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.batches.push(request.clone());
        if let Some(error) = state.batch_failures.pop_front() {
            return Err(error);
        }

        let mut results = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let key = item.idempotency_key();
            let outcome = match state.applied.get(&key).cloned() {
                Some(outcome) => {
                    state.replayed += 1;
                    outcome
                }
                None => {
                    let outcome = self.apply(state, item);
                    state.applied.insert(key, outcome.clone());
                    outcome
                }
            };
            results.push(ItemResult {
                op_id: item.op_id,
                outcome,
            });
        }

        if std::mem::take(&mut state.crash_after_apply) {
            drop(guard);
            panic!("simulated crash during send");
        }
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(SyncError::Timeout);
        }
        Ok(BatchResponse::new(results))
    }

    fn fetch(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let state = self.state.lock();
        let record = state
            .records
            .get(&request.remote_id)
            .filter(|r| r.entity_type == request.entity_type)
            .ok_or_else(|| SyncError::NotFound(format!("{}:{}", request.entity_type, request.remote_id)))?;
        Ok(FetchResponse {
            payload: record.payload.clone(),
            version: record.version,
            updated_at: record.updated_at,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Serves a [`RemoteSimulator`] behind
/// [`LoopbackClient`](geode_sync_engine::LoopbackClient), so an
/// [`HttpTransport`](geode_sync_engine::HttpTransport) can talk to it with
/// real CBOR bodies.
#[derive(Clone)]
pub struct LoopbackRemote(
    /// The served simulator.
    pub Arc<RemoteSimulator>,
);

impl LoopbackServer for LoopbackRemote {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpFailure> {
        let encoded = match path {
            "/sync/batch" => {
                let request = BatchRequest::decode(body).map_err(bad_request)?;
                self.0.send_batch(&request).map_err(as_http_failure)?.encode()
            }
            "/sync/fetch" => {
                let request = FetchRequest::decode(body).map_err(bad_request)?;
                self.0.fetch(&request).map_err(as_http_failure)?.encode()
            }
            other => {
                return Err(HttpFailure::Status {
                    code: 404,
                    body: format!("no route for {other}"),
                })
            }
        };
        encoded.map_err(|e| HttpFailure::Status {
            code: 500,
            body: e.to_string(),
        })
    }

    fn is_reachable(&self) -> bool {
        self.0.is_connected()
    }
}

fn bad_request(error: impl std::fmt::Display) -> HttpFailure {
    HttpFailure::Status {
        code: 400,
        body: error.to_string(),
    }
}

fn as_http_failure(error: SyncError) -> HttpFailure {
    match error {
        SyncError::Timeout => HttpFailure::Timeout,
        SyncError::NotConnected => HttpFailure::Network("remote offline".into()),
        SyncError::NotFound(what) => HttpFailure::Status { code: 404, body: what },
        other if other.is_retryable() => HttpFailure::Status {
            code: 503,
            body: other.to_string(),
        },
        other => bad_request(other),
    }
}

fn next_remote_id(state: &mut RemoteState) -> String {
    state.next_id += 1;
    format!("r-{}", state.next_id)
}

fn change_for(record: &RemoteRecord) -> Option<RemoteChange> {
    Some(RemoteChange {
        entity_type: EntityType::from_name(&record.entity_type)?,
        remote_id: record.remote_id.clone(),
        version: record.version,
        payload: record.payload.clone(),
        updated_at: record.updated_at,
    })
}

fn written_fields(payload: &DeltaPayload) -> Vec<(String, Value)> {
    let empty = Map::new();
    let fields = match payload {
        DeltaPayload::Full(Value::Object(fields)) => fields,
        DeltaPayload::Fields(delta) => &delta.set,
        _ => &empty,
    };
    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geode_core::ManualClock;
    use serde_json::json;

    fn create(op_id: u64, entity_id: &str, payload: Value) -> SyncOperation {
        SyncOperation {
            op_id,
            entity_type: "field_session".into(),
            operation: OperationType::Create,
            entity_id: entity_id.into(),
            remote_id: None,
            delta_payload: DeltaPayload::Full(payload),
            baseline_version: None,
            updated_at: 5,
        }
    }

    fn simulator() -> RemoteSimulator {
        RemoteSimulator::new(Arc::new(ManualClock::new(100)))
    }

    #[test]
    fn replayed_item_is_applied_once() {
        let remote = simulator();
        let batch = BatchRequest::new(vec![create(1, "a", json!({"name": "x"}))]);
        let first = remote.send_batch(&batch).unwrap();
        let second = remote.send_batch(&batch).unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.applied_count(), 1);
        assert_eq!(remote.replayed_count(), 1);
        assert_eq!(remote.live_records(EntityType::FieldSession).len(), 1);
    }

    #[test]
    fn stale_baseline_conflicts() {
        let remote = simulator();
        remote.send_batch(&BatchRequest::new(vec![create(1, "a", json!({"name": "x"}))])).unwrap();
        remote.remote_edit("r-1", json!({"name": "y"})).unwrap();

        let update = SyncOperation {
            op_id: 2,
            operation: OperationType::Update,
            remote_id: Some("r-1".into()),
            baseline_version: Some(1),
            delta_payload: DeltaPayload::Full(json!({"name": "z"})),
            ..create(2, "a", json!({}))
        };
        let response = remote.send_batch(&BatchRequest::new(vec![update])).unwrap();
        match response.result_for(2) {
            Some(ItemOutcome::Conflict {
                remote_version,
                remote_payload,
                ..
            }) => {
                assert_eq!(*remote_version, 2);
                assert_eq!(remote_payload, &Some(json!({"name": "y"})));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn unknown_parent_is_an_ordering_violation() {
        let remote = simulator();
        let child = create(1, "c", json!({"session_remote_id": "r-9"}));
        let response = remote.send_batch(&BatchRequest::new(vec![child])).unwrap();
        assert!(matches!(response.result_for(1), Some(ItemOutcome::Rejected { .. })));
        assert_eq!(remote.order_violations().len(), 1);
    }

    #[test]
    fn lost_response_still_applies() {
        let remote = simulator();
        remote.lose_next_responses(1);
        let batch = BatchRequest::new(vec![create(1, "a", json!({"name": "x"}))]);
        assert!(matches!(remote.send_batch(&batch), Err(SyncError::Timeout)));
        assert_eq!(remote.applied_count(), 1);
        assert!(remote.send_batch(&batch).is_ok());
        assert_eq!(remote.live_records(EntityType::FieldSession).len(), 1);
    }
}
