//! Sync operations.

use crate::delta::DeltaPayload;
use serde::{Deserialize, Serialize};

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Entity was created locally and has no remote id yet.
    Create,
    /// Entity already exists remotely and changed locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl OperationType {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            OperationType::Create => 1,
            OperationType::Update => 2,
            OperationType::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationType::Create),
            2 => Some(OperationType::Update),
            3 => Some(OperationType::Delete),
            _ => None,
        }
    }

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// A single item of an outbound sync batch.
///
/// `op_id`, `entity_id` and `baseline_version` together identify the
/// operation; the remote side uses them to recognise a replayed item after
/// a partial send and answer with the original outcome instead of applying
/// it twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Queue entry id that produced this item. Stable across retries.
    pub op_id: u64,
    /// Entity type name (e.g. `find_log`).
    pub entity_type: String,
    /// Operation kind.
    pub operation: OperationType,
    /// Client-assigned local id.
    pub entity_id: String,
    /// Remote id, once assigned.
    pub remote_id: Option<String>,
    /// Full payload, field delta or bare identifier.
    pub delta_payload: DeltaPayload,
    /// Remote version the client last observed.
    pub baseline_version: Option<u64>,
    /// Local modification time (ms since epoch) of the sent state.
    pub updated_at: u64,
}

impl SyncOperation {
    /// Returns the key the remote side uses to detect duplicates.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.entity_type,
            self.entity_id,
            self.op_id,
            self.baseline_version.map_or_else(|| "-".to_string(), |v| v.to_string())
        )
    }

    /// Returns the encoded size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.delta_payload.encoded_len()
    }
}
