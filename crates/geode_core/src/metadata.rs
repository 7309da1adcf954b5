//! Storage metadata and the persisted record envelope.
//!
//! Each cached entity is stored as one CBOR record holding the payload as
//! JSON text plus its [`StorageMetadata`]. The SHA-256 checksum covers the
//! payload text exactly as stored and is verified on every read.

use crate::entity::{CachedEntity, EntityType, LocalId};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of a payload checksum.
pub const CHECKSUM_LEN: usize = 32;

/// Bookkeeping kept next to every cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Schema version the payload conforms to.
    pub schema_version: u32,
    /// SHA-256 of the stored payload bytes.
    pub checksum: [u8; CHECKSUM_LEN],
    /// Stored size of payload plus snapshot.
    pub size_bytes: u64,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    /// Last local or accepted remote modification (ms since epoch).
    pub updated_at: u64,
    /// `updated_at` of the last state the remote confirmed.
    pub last_synced_at: Option<u64>,
    /// Expiry time for clean entries.
    pub ttl_expires_at: Option<u64>,
    /// True while local changes are unsynced.
    pub dirty: bool,
    /// Pinned entries are never evicted.
    pub pinned: bool,
    /// Remote version the local state is based on.
    pub remote_version: Option<u64>,
    /// Payload as last confirmed by the remote.
    pub synced_snapshot: Option<Value>,
    /// Tombstone awaiting remote delete.
    pub deleted: bool,
}

impl StorageMetadata {
    /// Creates metadata for a brand new local entity.
    pub fn new(schema_version: u32, now: u64) -> Self {
        Self {
            schema_version,
            checksum: [0; CHECKSUM_LEN],
            size_bytes: 0,
            created_at: now,
            updated_at: now,
            last_synced_at: None,
            ttl_expires_at: None,
            dirty: true,
            pinned: false,
            remote_version: None,
            synced_snapshot: None,
            deleted: false,
        }
    }

    /// Records a local modification.
    ///
    /// `updated_at` always moves past `last_synced_at`, so the entry is dirty
    /// afterwards even if the clock went backwards.
    pub fn touch(&mut self, now: u64) {
        let floor = self.last_synced_at.map_or(0, |t| t + 1);
        self.updated_at = now.max(self.updated_at).max(floor);
        self.recompute_dirty();
    }

    /// Records that the remote confirmed the state written at `synced_updated_at`.
    ///
    /// Local edits made after that point keep the entry dirty.
    pub fn mark_synced(&mut self, synced_updated_at: u64, remote_version: u64, snapshot: Value) {
        self.last_synced_at = Some(self.last_synced_at.map_or(synced_updated_at, |t| t.max(synced_updated_at)));
        self.remote_version = Some(remote_version);
        self.synced_snapshot = Some(snapshot);
        self.recompute_dirty();
    }

    /// Re-derives `dirty` from the timestamps.
    pub fn recompute_dirty(&mut self) {
        self.dirty = match self.last_synced_at {
            None => true,
            Some(synced) => self.updated_at > synced,
        };
    }

    /// Returns true if the TTL has elapsed.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl_expires_at.is_some_and(|t| t <= now)
    }

    /// Returns true if eviction may drop the entry.
    pub fn is_evictable(&self, has_remote_id: bool) -> bool {
        has_remote_id && !self.dirty && !self.pinned && !self.deleted
    }
}

/// Computes the checksum of stored payload bytes.
pub fn payload_checksum(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    Sha256::digest(bytes).into()
}

/// Persisted envelope.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    entity_type: EntityType,
    local_id: LocalId,
    remote_id: Option<String>,
    payload: String,
    metadata: StorageMetadata,
}

/// Why a stored record could not be opened.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordDefect {
    /// The envelope itself does not decode.
    Undecodable(String),
    /// The envelope decodes but the payload does not match its checksum or
    /// does not parse. The remote id is known, so the entity can be refetched.
    BadPayload {
        remote_id: Option<String>,
        message: String,
    },
}

impl RecordDefect {
    pub(crate) fn message(&self) -> &str {
        match self {
            RecordDefect::Undecodable(message) => message,
            RecordDefect::BadPayload { message, .. } => message,
        }
    }

    pub(crate) fn remote_id(&self) -> Option<&str> {
        match self {
            RecordDefect::Undecodable(_) => None,
            RecordDefect::BadPayload { remote_id, .. } => remote_id.as_deref(),
        }
    }
}

/// Recomputes checksum and size, then encodes the entity.
pub(crate) fn seal(entity: &mut CachedEntity) -> CoreResult<Vec<u8>> {
    let payload = serde_json::to_string(&entity.payload).map_err(|e| CoreError::encoding(e.to_string()))?;
    let snapshot_len = match &entity.metadata.synced_snapshot {
        Some(snapshot) => serde_json::to_vec(snapshot)
            .map_err(|e| CoreError::encoding(e.to_string()))?
            .len(),
        None => 0,
    };
    entity.metadata.checksum = payload_checksum(payload.as_bytes());
    entity.metadata.size_bytes = (payload.len() + snapshot_len) as u64;

    let record = StoredRecord {
        entity_type: entity.entity_type,
        local_id: entity.local_id,
        remote_id: entity.remote_id.clone(),
        payload,
        metadata: entity.metadata.clone(),
    };
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&record, &mut bytes).map_err(|e| CoreError::encoding(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a record and verifies its checksum.
pub(crate) fn open(bytes: &[u8]) -> Result<CachedEntity, RecordDefect> {
    let record: StoredRecord =
        ciborium::de::from_reader(bytes).map_err(|e| RecordDefect::Undecodable(e.to_string()))?;

    if payload_checksum(record.payload.as_bytes()) != record.metadata.checksum {
        return Err(RecordDefect::BadPayload {
            remote_id: record.remote_id,
            message: "payload checksum mismatch".into(),
        });
    }
    let payload: Value = match serde_json::from_str(&record.payload) {
        Ok(payload) => payload,
        Err(e) => {
            return Err(RecordDefect::BadPayload {
                remote_id: record.remote_id,
                message: format!("payload does not parse: {e}"),
            })
        }
    };

    Ok(CachedEntity {
        entity_type: record.entity_type,
        local_id: record.local_id,
        remote_id: record.remote_id,
        payload,
        metadata: record.metadata,
    })
}

/// Decodes only the metadata, skipping checksum verification.
///
/// Used by eviction and size accounting, which never hand out payloads.
pub(crate) fn peek(bytes: &[u8]) -> Option<(Option<String>, StorageMetadata)> {
    ciborium::de::from_reader::<StoredRecord, _>(bytes)
        .ok()
        .map(|record| (record.remote_id, record.metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(payload: Value) -> CachedEntity {
        CachedEntity {
            entity_type: EntityType::Specimen,
            local_id: LocalId::new(),
            remote_id: Some("r-1".into()),
            payload,
            metadata: StorageMetadata::new(1, 10),
        }
    }

    #[test]
    fn new_metadata_is_dirty() {
        let meta = StorageMetadata::new(1, 10);
        assert!(meta.dirty);
        assert_eq!(meta.created_at, 10);
        assert!(!meta.is_evictable(true));
    }

    #[test]
    fn touch_moves_past_last_sync() {
        let mut meta = StorageMetadata::new(1, 10);
        meta.mark_synced(10, 1, json!({}));
        assert!(!meta.dirty);

        // clock moved backwards
        meta.touch(5);
        assert_eq!(meta.updated_at, 11);
        assert!(meta.dirty);
    }

    #[test]
    fn edit_during_flight_stays_dirty() {
        let mut meta = StorageMetadata::new(1, 10);
        let dispatched = meta.updated_at;
        meta.touch(20);
        meta.mark_synced(dispatched, 1, json!({}));
        assert!(meta.dirty);
        meta.mark_synced(20, 2, json!({}));
        assert!(!meta.dirty);
    }

    #[test]
    fn expiry() {
        let mut meta = StorageMetadata::new(1, 10);
        assert!(!meta.is_expired(u64::MAX));
        meta.ttl_expires_at = Some(100);
        assert!(!meta.is_expired(99));
        assert!(meta.is_expired(100));
    }

    #[test]
    fn seal_and_open() {
        let mut e = entity(json!({"mineral": "quartz", "weight_g": 12}));
        let bytes = seal(&mut e).unwrap();
        assert!(e.metadata.size_bytes > 0);
        let opened = open(&bytes).unwrap();
        assert_eq!(opened, e);
    }

    #[test]
    fn flipped_payload_byte_is_detected() {
        let mut e = entity(json!({"mineral": "quartz"}));
        let mut bytes = seal(&mut e).unwrap();
        let pos = bytes.windows(6).position(|w| w == b"quartz").unwrap();
        bytes[pos] = b'Q';

        match open(&bytes) {
            Err(RecordDefect::BadPayload { remote_id, .. }) => assert_eq!(remote_id.as_deref(), Some("r-1")),
            other => panic!("expected bad payload, got {other:?}"),
        }
        assert!(peek(&bytes).is_some());
    }

    #[test]
    fn garbage_is_undecodable() {
        assert!(matches!(open(&[0xff, 0x01]), Err(RecordDefect::Undecodable(_))));
        assert!(peek(&[0xff, 0x01]).is_none());
    }
}
