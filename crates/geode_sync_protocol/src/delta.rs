//! Delta computation.
//!
//! Updates carry only the top-level fields that changed since the last
//! synced snapshot. Nested objects and arrays are compared and sent whole:
//! a change anywhere below a top-level field resends that field.

use crate::operation::OperationType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Changed top-level fields of an entity payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    /// Fields added or modified, with their new values.
    pub set: Map<String, Value>,
    /// Fields removed.
    pub unset: Vec<String>,
}

impl FieldDelta {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Returns the names of all touched fields.
    pub fn changed_fields(&self) -> BTreeSet<&str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.unset.iter().map(String::as_str))
            .collect()
    }

    /// Applies this delta to an object payload.
    ///
    /// Non-object targets are replaced by an object first.
    pub fn apply_to(&self, target: &mut Value) {
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        if let Value::Object(fields) = target {
            for name in &self.unset {
                fields.remove(name);
            }
            for (name, value) in &self.set {
                fields.insert(name.clone(), value.clone());
            }
        }
    }

    /// Folds a later delta over this one.
    pub fn merge(&mut self, later: FieldDelta) {
        for name in &later.unset {
            self.set.remove(name);
        }
        for name in later.set.keys() {
            self.unset.retain(|n| n != name);
        }
        for name in later.unset {
            if !self.unset.contains(&name) {
                self.unset.push(name);
            }
        }
        self.set.extend(later.set);
    }
}

/// Payload attached to a sync operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaPayload {
    /// The whole entity (creates, or updates without a snapshot).
    Full(Value),
    /// Only the changed fields.
    Fields(FieldDelta),
    /// Deletes carry nothing but the identity in the enclosing item.
    Identifier,
}

impl DeltaPayload {
    /// Returns the JSON-encoded size of the payload in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            DeltaPayload::Full(value) => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
            DeltaPayload::Fields(delta) => serde_json::to_vec(delta).map(|v| v.len()).unwrap_or(0),
            DeltaPayload::Identifier => 0,
        }
    }

    /// Returns true if there is nothing to send for an update.
    pub fn is_noop(&self) -> bool {
        matches!(self, DeltaPayload::Fields(delta) if delta.is_empty())
    }

    /// Sets a top-level field in whatever form the payload has.
    ///
    /// Used to attach resolved parent remote ids at transmit time. Returns
    /// `false` for identifier payloads.
    pub fn set_field(&mut self, name: &str, value: Value) -> bool {
        match self {
            DeltaPayload::Full(Value::Object(fields)) => {
                fields.insert(name.to_string(), value);
                true
            }
            DeltaPayload::Full(_) => false,
            DeltaPayload::Fields(delta) => {
                delta.unset.retain(|n| n != name);
                delta.set.insert(name.to_string(), value);
                true
            }
            DeltaPayload::Identifier => false,
        }
    }

    /// Returns the field names this payload writes.
    pub fn touched_fields(&self) -> BTreeSet<String> {
        match self {
            DeltaPayload::Full(Value::Object(fields)) => fields.keys().cloned().collect(),
            DeltaPayload::Full(_) | DeltaPayload::Identifier => BTreeSet::new(),
            DeltaPayload::Fields(delta) => {
                delta.changed_fields().into_iter().map(String::from).collect()
            }
        }
    }
}

/// Diffs two payloads at top-level field granularity.
pub fn diff_fields(base: &Value, current: &Value) -> FieldDelta {
    let empty = Map::new();
    let base_fields = base.as_object().unwrap_or(&empty);
    let current_fields = current.as_object().unwrap_or(&empty);

    let mut delta = FieldDelta::default();
    for (name, value) in current_fields {
        if base_fields.get(name) != Some(value) {
            delta.set.insert(name.clone(), value.clone());
        }
    }
    for name in base_fields.keys() {
        if !current_fields.contains_key(name) {
            delta.unset.push(name.clone());
        }
    }
    delta
}

/// Computes the payload to send for an operation.
///
/// - `Create` sends the full current value
/// - `Update` sends the field diff against `snapshot`, or the full value if
///   no snapshot was retained
/// - `Delete` sends only the identifier
pub fn compute_delta(
    operation: OperationType,
    current: &Value,
    snapshot: Option<&Value>,
) -> DeltaPayload {
    match operation {
        OperationType::Create => DeltaPayload::Full(current.clone()),
        OperationType::Update => match snapshot {
            Some(base) => DeltaPayload::Fields(diff_fields(base, current)),
            None => DeltaPayload::Full(current.clone()),
        },
        OperationType::Delete => DeltaPayload::Identifier,
    }
}
