//! Protocol messages exchanged with the remote backend.
//!
//! The remote boundary is a single batch endpoint: the client posts an
//! ordered list of [`SyncOperation`]s and receives one [`ItemResult`] per
//! item. A separate fetch call returns the authoritative copy of one entity,
//! used to repair corrupted cache entries.

use crate::error::{from_cbor, to_cbor, ProtocolResult};
use crate::operation::SyncOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered batch of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Items, in the order the scheduler chose.
    pub items: Vec<SyncOperation>,
}

impl BatchRequest {
    /// Creates a batch.
    pub fn new(items: Vec<SyncOperation>) -> Self {
        Self { items }
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Per-item outcome reported by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// The remote applied the item.
    Accepted {
        /// Remote id of the entity.
        remote_id: String,
        /// New remote version.
        version: u64,
    },
    /// The remote copy diverged from the item's baseline.
    Conflict {
        /// Remote id, if the remote already holds the entity.
        remote_id: Option<String>,
        /// Current remote version.
        remote_version: u64,
        /// Current remote payload; `None` if the remote deleted it.
        remote_payload: Option<Value>,
        /// Remote modification time in ms since epoch.
        remote_updated_at: u64,
    },
    /// The remote refused the item permanently (e.g. validation).
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
}

/// Result for one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// `op_id` of the item this result answers.
    pub op_id: u64,
    /// Outcome.
    pub outcome: ItemOutcome,
}

/// Response to a [`BatchRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// One result per received item. Items without a result are treated as
    /// not delivered.
    pub results: Vec<ItemResult>,
}

impl BatchResponse {
    /// Creates a response.
    pub fn new(results: Vec<ItemResult>) -> Self {
        Self { results }
    }

    /// Finds the result for an item.
    pub fn result_for(&self, op_id: u64) -> Option<&ItemOutcome> {
        self.results
            .iter()
            .find(|r| r.op_id == op_id)
            .map(|r| &r.outcome)
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Request for the authoritative copy of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Entity type name.
    pub entity_type: String,
    /// Remote id.
    pub remote_id: String,
}

impl FetchRequest {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Response to a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Current payload; `None` if the remote no longer has the entity.
    pub payload: Option<Value>,
    /// Current remote version.
    pub version: u64,
    /// Remote modification time in ms since epoch.
    pub updated_at: u64,
}

impl FetchResponse {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
