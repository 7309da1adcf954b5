//! Per-type configuration.
//!
//! The registry is the one place that knows, for each [`EntityType`], its
//! schema, current schema version and migrations, sync priority, conflict
//! policy and default TTL, plus the dependency edges between types. It is
//! validated once at construction; a cycle, a migration gap or an edge to
//! an unregistered type fails fast.

use crate::entity::EntityType;
use crate::error::{CoreError, CoreResult};
use crate::graph::{DependencyEdge, DependencyGraph};
use crate::migration::{MigrationTable, SchemaVersion};
use crate::schema::{EntitySchema, FieldKind};
use geode_sync_protocol::ConflictPolicy;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration of one entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeConfig {
    /// Payload schema at `schema_version`.
    pub schema: EntitySchema,
    /// Current schema version.
    pub schema_version: SchemaVersion,
    /// Upgrade steps from older versions.
    pub migrations: MigrationTable,
    /// Sync priority; higher goes first.
    pub priority: u8,
    /// Conflict policy.
    pub policy: ConflictPolicy,
    /// TTL applied to clean entries, if any.
    pub default_ttl: Option<Duration>,
}

impl EntityTypeConfig {
    /// Creates a config at schema version 1 with the default policy.
    pub fn new(schema: EntitySchema, priority: u8) -> Self {
        Self {
            schema,
            schema_version: 1,
            migrations: MigrationTable::new(),
            priority,
            policy: ConflictPolicy::default(),
            default_ttl: None,
        }
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Sets the schema version and its migrations.
    #[must_use]
    pub fn with_migrations(mut self, schema_version: SchemaVersion, migrations: MigrationTable) -> Self {
        self.schema_version = schema_version;
        self.migrations = migrations;
        self
    }
}

/// Validated per-type configuration and dependency graph.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    types: BTreeMap<EntityType, EntityTypeConfig>,
    graph: DependencyGraph,
}

impl EntityRegistry {
    /// Starts an empty registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns the standard rockhounding configuration.
    pub fn rockhounding() -> CoreResult<Self> {
        RegistryBuilder::rockhounding().build()
    }

    /// Returns the configuration of a type.
    pub fn config(&self, entity_type: EntityType) -> CoreResult<&EntityTypeConfig> {
        self.types
            .get(&entity_type)
            .ok_or_else(|| CoreError::configuration(format!("entity type '{entity_type}' is not registered")))
    }

    /// Returns the registered types.
    pub fn types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.types.keys().copied()
    }

    /// Returns the dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Returns the sync priority of a type (0 if unregistered).
    pub fn priority(&self, entity_type: EntityType) -> u8 {
        self.types.get(&entity_type).map_or(0, |c| c.priority)
    }

    /// Returns the conflict policy of a type.
    pub fn policy(&self, entity_type: EntityType) -> ConflictPolicy {
        self.types
            .get(&entity_type)
            .map(|c| c.policy)
            .unwrap_or_default()
    }

    /// Validates a payload against the type's schema and reference fields.
    pub fn validate(&self, entity_type: EntityType, payload: &Value) -> CoreResult<()> {
        self.config(entity_type)?.schema.validate(entity_type, payload)?;
        self.graph.dependencies_of(entity_type, payload)?;
        Ok(())
    }
}

/// Builder for [`EntityRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: BTreeMap<EntityType, EntityTypeConfig>,
    edges: Vec<DependencyEdge>,
}

impl RegistryBuilder {
    /// Returns a builder holding the standard rockhounding configuration.
    pub fn rockhounding() -> Self {
        let hour = Duration::from_secs(3600);
        Self::default()
            .register(
                EntityType::FieldSession,
                EntityTypeConfig::new(
                    EntitySchema::new()
                        .required("name", FieldKind::String)
                        .required("started_at", FieldKind::Integer)
                        .optional("ended_at", FieldKind::Integer)
                        .optional("site", FieldKind::String)
                        .optional("notes", FieldKind::String),
                    100,
                ),
            )
            .register(
                EntityType::FindLog,
                EntityTypeConfig::new(
                    EntitySchema::new()
                        .required("session_id", FieldKind::String)
                        .optional("location", FieldKind::Object)
                        .optional("found_at", FieldKind::Integer)
                        .optional("notes", FieldKind::String),
                    90,
                ),
            )
            .register(
                EntityType::Specimen,
                EntityTypeConfig::new(
                    EntitySchema::new()
                        .required("find_log_id", FieldKind::String)
                        .required("mineral", FieldKind::String)
                        .optional("weight_g", FieldKind::Number)
                        .optional("tags", FieldKind::Array),
                    80,
                )
                .with_policy(ConflictPolicy::FieldMerge),
            )
            .register(
                EntityType::Capture,
                EntityTypeConfig::new(
                    EntitySchema::new()
                        .required("specimen_id", FieldKind::String)
                        .optional("image_ref", FieldKind::String)
                        .optional("classification", FieldKind::Object)
                        .optional("stage", FieldKind::String),
                    60,
                ),
            )
            .register(
                EntityType::AnalyticsCache,
                EntityTypeConfig::new(EntitySchema::new().required("metric", FieldKind::String), 20)
                    .with_ttl(24 * hour),
            )
            .register(
                EntityType::Telemetry,
                EntityTypeConfig::new(EntitySchema::new().required("event", FieldKind::String), 10)
                    .with_ttl(hour),
            )
            .edge(DependencyEdge::new(
                EntityType::FindLog,
                EntityType::FieldSession,
                "session_id",
                "session_remote_id",
            ))
            .edge(DependencyEdge::new(
                EntityType::Specimen,
                EntityType::FindLog,
                "find_log_id",
                "find_log_remote_id",
            ))
            .edge(DependencyEdge::new(
                EntityType::Capture,
                EntityType::Specimen,
                "specimen_id",
                "specimen_remote_id",
            ))
    }

    /// Registers or replaces a type.
    #[must_use]
    pub fn register(mut self, entity_type: EntityType, config: EntityTypeConfig) -> Self {
        self.types.insert(entity_type, config);
        self
    }

    /// Adds a dependency edge.
    #[must_use]
    pub fn edge(mut self, edge: DependencyEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Overrides the policy of a registered type.
    #[must_use]
    pub fn policy(mut self, entity_type: EntityType, policy: ConflictPolicy) -> Self {
        if let Some(config) = self.types.get_mut(&entity_type) {
            config.policy = policy;
        }
        self
    }

    /// Overrides the TTL of a registered type.
    #[must_use]
    pub fn ttl(mut self, entity_type: EntityType, ttl: Option<Duration>) -> Self {
        if let Some(config) = self.types.get_mut(&entity_type) {
            config.default_ttl = ttl;
        }
        self
    }

    /// Validates and builds the registry.
    pub fn build(self) -> CoreResult<EntityRegistry> {
        for edge in &self.edges {
            for t in [edge.dependent, edge.parent] {
                if !self.types.contains_key(&t) {
                    return Err(CoreError::configuration(format!(
                        "dependency edge references unregistered type '{t}'"
                    )));
                }
            }
        }
        for (entity_type, config) in &self.types {
            if config.schema_version == 0 {
                return Err(CoreError::configuration(format!(
                    "'{entity_type}' schema version must be at least 1"
                )));
            }
            config.migrations.validate(config.schema_version)?;
        }
        let graph = DependencyGraph::new(self.edges)?;
        Ok(EntityRegistry {
            types: self.types,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationKind, MigrationStep};
    use serde_json::json;

    #[test]
    fn rockhounding_defaults() {
        let registry = EntityRegistry::rockhounding().unwrap();
        assert_eq!(registry.types().count(), EntityType::ALL.len());
        assert_eq!(registry.priority(EntityType::FieldSession), 100);
        assert_eq!(registry.priority(EntityType::Telemetry), 10);
        assert_eq!(registry.policy(EntityType::FindLog), ConflictPolicy::LastWriteWins);
        assert_eq!(registry.policy(EntityType::Specimen), ConflictPolicy::FieldMerge);
        assert!(registry.config(EntityType::Telemetry).unwrap().default_ttl.is_some());
    }

    #[test]
    fn priorities_follow_dependencies() {
        let registry = EntityRegistry::rockhounding().unwrap();
        for edge in registry.graph().edges() {
            assert!(registry.priority(edge.parent) > registry.priority(edge.dependent));
        }
    }

    #[test]
    fn validate_checks_schema_and_references() {
        let registry = EntityRegistry::rockhounding().unwrap();
        assert!(registry
            .validate(EntityType::FieldSession, &json!({"name": "Quarry", "started_at": 1}))
            .is_ok());
        assert!(registry
            .validate(EntityType::FindLog, &json!({"session_id": "not-a-uuid"}))
            .is_err());
    }

    #[test]
    fn unregistered_type_is_configuration_error() {
        let registry = EntityRegistry::builder()
            .register(EntityType::Telemetry, EntityTypeConfig::new(EntitySchema::new(), 1))
            .build()
            .unwrap();
        assert!(matches!(
            registry.config(EntityType::Specimen),
            Err(CoreError::Configuration { .. })
        ));
    }

    #[test]
    fn edge_to_unregistered_type_fails() {
        let result = EntityRegistry::builder()
            .register(EntityType::FindLog, EntityTypeConfig::new(EntitySchema::new(), 1))
            .edge(DependencyEdge::new(EntityType::FindLog, EntityType::FieldSession, "a", "b"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn cycle_fails_build() {
        let result = RegistryBuilder::rockhounding()
            .edge(DependencyEdge::new(
                EntityType::FieldSession,
                EntityType::Capture,
                "capture_id",
                "capture_remote_id",
            ))
            .build();
        assert!(matches!(result, Err(CoreError::Configuration { .. })));
    }

    #[test]
    fn migration_gap_fails_build() {
        let mut table = MigrationTable::new();
        table
            .register(MigrationStep::new(
                1,
                "add_stage",
                MigrationKind::AddField {
                    name: "stage".into(),
                    default: json!("new"),
                },
            ))
            .unwrap();
        let config = EntityTypeConfig::new(EntitySchema::new(), 60).with_migrations(3, table);
        let result = RegistryBuilder::rockhounding()
            .register(EntityType::Capture, config)
            .build();
        assert!(matches!(result, Err(CoreError::MigrationFailed { .. })));
    }

    #[test]
    fn overrides_apply() {
        let registry = RegistryBuilder::rockhounding()
            .policy(EntityType::FieldSession, ConflictPolicy::Manual)
            .ttl(EntityType::Telemetry, None)
            .build()
            .unwrap();
        assert_eq!(registry.policy(EntityType::FieldSession), ConflictPolicy::Manual);
        assert!(registry.config(EntityType::Telemetry).unwrap().default_ttl.is_none());
    }
}
