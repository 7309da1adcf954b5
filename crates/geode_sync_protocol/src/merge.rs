//! Three-way field merge.
//!
//! Fields changed on only one side since the common base are taken from that
//! side. Fields changed on both sides to different values are overlapping:
//!
//! - arrays holding only scalars merge as sets (remote order kept, elements
//!   removed locally dropped, elements added locally appended)
//! - anything else falls back to last-write-wins on the entity timestamps,
//!   with ties going to the remote side

use crate::conflict::ConflictSide;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Result of a three-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The merged payload.
    pub merged: Value,
    /// Fields only the local side changed.
    pub local_only: Vec<String>,
    /// Fields only the remote side changed.
    pub remote_only: Vec<String>,
    /// Fields both sides changed to different values.
    pub overlapping: Vec<String>,
    /// Side whose value won the overlapping non-array fields.
    pub overlap_winner: ConflictSide,
}

/// Merges `local` and `remote` against their common `base`.
///
/// A missing base (both sides created independently) is treated as an empty
/// object.
pub fn merge_fields(
    base: Option<&Value>,
    local: &Value,
    remote: &Value,
    local_updated_at: u64,
    remote_updated_at: u64,
) -> MergeOutcome {
    let empty = Map::new();
    let base_fields = base.and_then(Value::as_object).unwrap_or(&empty);
    let local_fields = local.as_object().unwrap_or(&empty);
    let remote_fields = remote.as_object().unwrap_or(&empty);

    let overlap_winner = if local_updated_at > remote_updated_at {
        ConflictSide::Local
    } else {
        ConflictSide::Remote
    };

    let names: BTreeSet<&String> = base_fields
        .keys()
        .chain(local_fields.keys())
        .chain(remote_fields.keys())
        .collect();

    let mut merged = Map::new();
    let mut local_only = Vec::new();
    let mut remote_only = Vec::new();
    let mut overlapping = Vec::new();

    for name in names {
        let b = base_fields.get(name);
        let l = local_fields.get(name);
        let r = remote_fields.get(name);
        let local_changed = l != b;
        let remote_changed = r != b;

        let chosen = match (local_changed, remote_changed) {
            (false, false) => b.cloned(),
            (true, false) => {
                local_only.push(name.clone());
                l.cloned()
            }
            (false, true) => {
                remote_only.push(name.clone());
                r.cloned()
            }
            (true, true) if l == r => l.cloned(),
            (true, true) => {
                overlapping.push(name.clone());
                match (l, r) {
                    (Some(Value::Array(la)), Some(Value::Array(ra)))
                        if all_scalars(la) && all_scalars(ra) =>
                    {
                        let base_items: &[Value] = match b {
                            Some(Value::Array(items)) => items.as_slice(),
                            _ => &[],
                        };
                        Some(Value::Array(union_arrays(base_items, la, ra)))
                    }
                    _ => match overlap_winner {
                        ConflictSide::Local => l.cloned(),
                        _ => r.cloned(),
                    },
                }
            }
        };

        if let Some(value) = chosen {
            merged.insert(name.clone(), value);
        }
    }

    MergeOutcome {
        merged: Value::Object(merged),
        local_only,
        remote_only,
        overlapping,
        overlap_winner,
    }
}

fn all_scalars(items: &[Value]) -> bool {
    items
        .iter()
        .all(|v| !matches!(v, Value::Array(_) | Value::Object(_)))
}

fn union_arrays(base: &[Value], local: &[Value], remote: &[Value]) -> Vec<Value> {
    let removed_locally: Vec<&Value> = base.iter().filter(|v| !local.contains(v)).collect();
    let mut result: Vec<Value> = remote
        .iter()
        .filter(|v| !removed_locally.contains(v))
        .cloned()
        .collect();
    for item in local {
        if !base.contains(item) && !result.contains(item) {
            result.push(item.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_overlapping_fields_combine() {
        let base = json!({"mineral": "quartz", "weight_g": 10, "notes": ""});
        let local = json!({"mineral": "quartz", "weight_g": 12, "notes": ""});
        let remote = json!({"mineral": "smoky quartz", "weight_g": 10, "notes": ""});

        let outcome = merge_fields(Some(&base), &local, &remote, 5, 9);
        assert_eq!(
            outcome.merged,
            json!({"mineral": "smoky quartz", "weight_g": 12, "notes": ""})
        );
        assert_eq!(outcome.local_only, vec!["weight_g"]);
        assert_eq!(outcome.remote_only, vec!["mineral"]);
        assert!(outcome.overlapping.is_empty());
    }

    #[test]
    fn overlapping_scalar_uses_last_write() {
        let base = json!({"notes": "a"});
        let local = json!({"notes": "local"});
        let remote = json!({"notes": "remote"});

        let newer_local = merge_fields(Some(&base), &local, &remote, 20, 10);
        assert_eq!(newer_local.merged, json!({"notes": "local"}));
        assert_eq!(newer_local.overlap_winner, ConflictSide::Local);

        let newer_remote = merge_fields(Some(&base), &local, &remote, 10, 20);
        assert_eq!(newer_remote.merged, json!({"notes": "remote"}));

        let tie = merge_fields(Some(&base), &local, &remote, 10, 10);
        assert_eq!(tie.merged, json!({"notes": "remote"}));
    }

    #[test]
    fn scalar_arrays_merge_as_sets() {
        let base = json!({"tags": ["agate", "river"]});
        let local = json!({"tags": ["agate", "banded"]});
        let remote = json!({"tags": ["agate", "river", "polished"]});

        let outcome = merge_fields(Some(&base), &local, &remote, 1, 2);
        assert_eq!(outcome.merged, json!({"tags": ["agate", "polished", "banded"]}));
        assert_eq!(outcome.overlapping, vec!["tags"]);
    }

    #[test]
    fn object_arrays_are_atomic() {
        let base = json!({"related": [{"id": 1}]});
        let local = json!({"related": [{"id": 1}, {"id": 2}]});
        let remote = json!({"related": [{"id": 3}]});

        let outcome = merge_fields(Some(&base), &local, &remote, 30, 20);
        assert_eq!(outcome.merged, json!({"related": [{"id": 1}, {"id": 2}]}));
    }

    #[test]
    fn removal_on_one_side_is_kept() {
        let base = json!({"a": 1, "b": 2});
        let local = json!({"a": 1});
        let remote = json!({"a": 1, "b": 2, "c": 3});

        let outcome = merge_fields(Some(&base), &local, &remote, 1, 1);
        assert_eq!(outcome.merged, json!({"a": 1, "c": 3}));
    }

    #[test]
    fn missing_base_treats_every_difference_as_overlap() {
        let local = json!({"name": "Creek", "site": "north"});
        let remote = json!({"name": "Creek bed", "site": "north"});

        let outcome = merge_fields(None, &local, &remote, 1, 2);
        assert_eq!(outcome.merged, json!({"name": "Creek bed", "site": "north"}));
        assert_eq!(outcome.overlapping, vec!["name"]);
    }
}
