//! Conflict records and resolution policies.

use crate::error::{from_cbor, to_cbor, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Policy for resolving a divergence between local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newest `updated_at` wins; ties go to the remote side.
    #[default]
    LastWriteWins,
    /// Three-way merge of top-level fields, overlapping fields by
    /// last-write-wins.
    FieldMerge,
    /// Record the conflict and wait for an explicit decision.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy resolves conflicts without user input.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictPolicy::LastWriteWins => 1,
            ConflictPolicy::FieldMerge => 2,
            ConflictPolicy::Manual => 3,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictPolicy::LastWriteWins),
            2 => Some(ConflictPolicy::FieldMerge),
            3 => Some(ConflictPolicy::Manual),
            _ => None,
        }
    }
}

/// Resolution state of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Waiting for a decision.
    Pending,
    /// Resolved by the entity type's policy.
    AutoResolved,
    /// Resolved by an explicit user choice.
    Manual,
}

/// Which version a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    /// The local version.
    Local,
    /// The remote version.
    Remote,
    /// A combination of both.
    Merged,
}

/// Decision passed to `resolve_conflict`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionChoice {
    /// Keep the local payload and push it on top of the remote version.
    KeepLocal,
    /// Adopt the remote payload.
    AcceptRemote,
    /// Use a hand-merged payload and push it.
    Merged(Value),
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    /// Payload; `None` if this side deleted the entity.
    pub payload: Option<Value>,
    /// Remote version number (the baseline for the local side).
    pub version: Option<u64>,
    /// Modification time in ms since epoch.
    pub updated_at: u64,
}

/// A detected divergence and its audit trail.
///
/// Both versions are kept verbatim, so the losing side of an automatic
/// resolution can always be recovered from the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Record id (`entity_type:entity_id`).
    pub id: String,
    /// Entity type name.
    pub entity_type: String,
    /// Local id of the entity.
    pub entity_id: String,
    /// Remote id, if either side knows it.
    pub remote_id: Option<String>,
    /// Policy in force when the conflict was detected.
    pub policy: ConflictPolicy,
    /// Local version at detection time.
    pub local_version: VersionSnapshot,
    /// Remote version at detection time.
    pub remote_version: VersionSnapshot,
    /// Last synced payload both sides started from, if retained.
    pub base: Option<Value>,
    /// Detection time in ms since epoch.
    pub detected_at: u64,
    /// Resolution state.
    pub resolution: ConflictResolution,
    /// Which side won, once resolved.
    pub winner: Option<ConflictSide>,
    /// Payload written by the resolution.
    pub resolved_payload: Option<Value>,
    /// Resolution time in ms since epoch.
    pub resolved_at: Option<u64>,
}

impl ConflictRecord {
    /// Creates a pending record.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        remote_id: Option<String>,
        policy: ConflictPolicy,
        local_version: VersionSnapshot,
        remote_version: VersionSnapshot,
        base: Option<Value>,
        detected_at: u64,
    ) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self {
            id: format!("{entity_type}:{entity_id}"),
            entity_type,
            entity_id,
            remote_id,
            policy,
            local_version,
            remote_version,
            base,
            detected_at,
            resolution: ConflictResolution::Pending,
            winner: None,
            resolved_payload: None,
            resolved_at: None,
        }
    }

    /// Returns true while no decision has been made.
    pub fn is_pending(&self) -> bool {
        self.resolution == ConflictResolution::Pending
    }

    /// Returns true if the remote side deleted the entity.
    pub fn is_remote_delete(&self) -> bool {
        self.remote_version.payload.is_none()
    }

    /// Records the outcome.
    pub fn resolve(
        &mut self,
        resolution: ConflictResolution,
        winner: ConflictSide,
        payload: Option<Value>,
        resolved_at: u64,
    ) {
        self.resolution = resolution;
        self.winner = Some(winner);
        self.resolved_payload = payload;
        self.resolved_at = Some(resolved_at);
    }

    /// Returns the version that did not win, if the record is resolved.
    pub fn losing_version(&self) -> Option<&VersionSnapshot> {
        match self.winner? {
            ConflictSide::Local => Some(&self.remote_version),
            ConflictSide::Remote => Some(&self.local_version),
            ConflictSide::Merged => None,
        }
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
