//! Entity identity and the cached entity value.

use crate::error::{CoreError, CoreResult};
use crate::metadata::StorageMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of domain entity held in the cache.
///
/// Names are stable: they appear in storage keys, table names and on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A day in the field at one site.
    FieldSession,
    /// A find recorded during a session.
    FindLog,
    /// A catalogued specimen from a find.
    Specimen,
    /// A photo capture and its classification pipeline state.
    Capture,
    /// Derived analytics kept for offline dashboards.
    AnalyticsCache,
    /// Usage telemetry waiting for upload.
    Telemetry,
}

impl EntityType {
    /// All entity types.
    pub const ALL: [EntityType; 6] = [
        EntityType::FieldSession,
        EntityType::FindLog,
        EntityType::Specimen,
        EntityType::Capture,
        EntityType::AnalyticsCache,
        EntityType::Telemetry,
    ];

    /// Returns the stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::FieldSession => "field_session",
            EntityType::FindLog => "find_log",
            EntityType::Specimen => "specimen",
            EntityType::Capture => "capture",
            EntityType::AnalyticsCache => "analytics_cache",
            EntityType::Telemetry => "telemetry",
        }
    }

    /// Parses a stable name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Returns the storage table holding entities of this type.
    pub fn table_name(&self) -> String {
        format!("entities.{}", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::from_name(s).ok_or_else(|| CoreError::configuration(format!("unknown entity type '{s}'")))
    }
}

/// Client-assigned identifier, stable for the lifetime of an entity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.0)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Reference to one entity: its type plus local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity type.
    pub entity_type: EntityType,
    /// Local id.
    pub local_id: LocalId,
}

impl EntityRef {
    /// Creates a reference.
    pub fn new(entity_type: EntityType, local_id: LocalId) -> Self {
        Self {
            entity_type,
            local_id,
        }
    }

    /// Returns the storage key, `type:local_id`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Parses a storage key.
    pub fn parse_key(key: &str) -> CoreResult<Self> {
        let (type_name, id) = key
            .split_once(':')
            .ok_or_else(|| CoreError::corruption(key, "malformed entity key"))?;
        let entity_type = EntityType::from_name(type_name)
            .ok_or_else(|| CoreError::corruption(key, "unknown entity type in key"))?;
        let local_id = id
            .parse()
            .map_err(|_| CoreError::corruption(key, "invalid local id in key"))?;
        Ok(Self::new(entity_type, local_id))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.local_id)
    }
}

/// An entity as held in the local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    /// Entity type.
    pub entity_type: EntityType,
    /// Local id.
    pub local_id: LocalId,
    /// Remote id, once the remote has accepted the entity.
    pub remote_id: Option<String>,
    /// Domain payload (a JSON object).
    pub payload: Value,
    /// Bookkeeping.
    pub metadata: StorageMetadata,
}

impl CachedEntity {
    /// Returns the entity's reference.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.local_id)
    }

    /// Returns true if local changes have not reached the remote yet.
    pub fn is_dirty(&self) -> bool {
        self.metadata.dirty
    }

    /// Returns true if the entity is a tombstone awaiting remote delete.
    pub fn is_deleted(&self) -> bool {
        self.metadata.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_roundtrip() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::from_name(t.as_str()), Some(t));
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!(EntityType::from_name("mine").is_none());
        assert_eq!(EntityType::FindLog.table_name(), "entities.find_log");
    }

    #[test]
    fn local_ids_are_unique() {
        let a = LocalId::new();
        let b = LocalId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<LocalId>().unwrap(), a);
    }

    #[test]
    fn entity_key_roundtrip() {
        let r = EntityRef::new(EntityType::Specimen, LocalId::new());
        let key = r.key();
        assert!(key.starts_with("specimen:"));
        assert_eq!(EntityRef::parse_key(&key).unwrap(), r);
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!(EntityRef::parse_key("specimen").is_err());
        assert!(EntityRef::parse_key("rock:00000000-0000-0000-0000-000000000000").is_err());
        assert!(EntityRef::parse_key("specimen:not-a-uuid").is_err());
    }
}
