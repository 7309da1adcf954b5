//! Payload schema migrations.
//!
//! Each entity type owns a [`MigrationTable`]: a version-indexed list of
//! steps, each upgrading a payload from version `n` to `n + 1`. Records
//! older than the registered schema version are upgraded on read, one step
//! at a time. After every step the payload must still be an object and the
//! step's own postcondition must hold; the final value is then checked
//! against the current schema by the store.
//!
//! ```ignore
//! let mut table = MigrationTable::new();
//! table.register(MigrationStep::new(1, "rename_weight", MigrationKind::RenameField {
//!     from: "weight".into(),
//!     to: "weight_g".into(),
//! }))?;
//! let upgraded = table.upgrade(EntityType::Specimen, payload, 1, 2)?;
//! ```

use crate::entity::EntityType;
use crate::error::{CoreError, CoreResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Schema version number.
pub type SchemaVersion = u32;

/// Custom transformation applied to a payload object.
pub type TransformFn = fn(&mut Map<String, Value>) -> Result<(), String>;

/// What a migration step does.
#[derive(Debug, Clone)]
pub enum MigrationKind {
    /// Adds a field with a default value, unless already present.
    AddField {
        /// Field name.
        name: String,
        /// Value for records that lack the field.
        default: Value,
    },
    /// Renames a field. Records without the source field are left alone.
    RenameField {
        /// Old name.
        from: String,
        /// New name.
        to: String,
    },
    /// Removes a field.
    RemoveField {
        /// Field name.
        name: String,
    },
    /// Arbitrary rewrite.
    Transform {
        /// Rewrite function.
        apply: TransformFn,
    },
}

/// One step, upgrading `from_version` to `from_version + 1`.
#[derive(Debug, Clone)]
pub struct MigrationStep {
    /// Version this step upgrades from.
    pub from_version: SchemaVersion,
    /// Human-readable name.
    pub name: String,
    /// The change.
    pub kind: MigrationKind,
}

impl MigrationStep {
    /// Creates a step.
    pub fn new(from_version: SchemaVersion, name: impl Into<String>, kind: MigrationKind) -> Self {
        Self {
            from_version,
            name: name.into(),
            kind,
        }
    }

    /// Returns the version this step produces.
    pub fn to_version(&self) -> SchemaVersion {
        self.from_version + 1
    }

    fn apply(&self, fields: &mut Map<String, Value>) -> Result<(), String> {
        match &self.kind {
            MigrationKind::AddField { name, default } => {
                fields.entry(name.clone()).or_insert_with(|| default.clone());
                if !fields.contains_key(name) {
                    return Err(format!("field '{name}' missing after add"));
                }
            }
            MigrationKind::RenameField { from, to } => {
                if let Some(value) = fields.remove(from) {
                    fields.insert(to.clone(), value);
                    if !fields.contains_key(to) {
                        return Err(format!("field '{to}' missing after rename"));
                    }
                }
                if fields.contains_key(from) {
                    return Err(format!("field '{from}' still present after rename"));
                }
            }
            MigrationKind::RemoveField { name } => {
                fields.remove(name);
            }
            MigrationKind::Transform { apply } => apply(fields)?,
        }
        Ok(())
    }
}

/// Information about a registered step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Version upgraded from.
    pub from_version: SchemaVersion,
    /// Step name.
    pub name: String,
}

/// Version-indexed migration steps for one entity type.
#[derive(Debug, Clone, Default)]
pub struct MigrationTable {
    steps: BTreeMap<SchemaVersion, MigrationStep>,
}

impl MigrationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step.
    ///
    /// Returns an error if a step for the same version already exists.
    pub fn register(&mut self, step: MigrationStep) -> CoreResult<()> {
        if step.from_version == 0 {
            return Err(CoreError::migration_failed("schema versions start at 1"));
        }
        if self.steps.contains_key(&step.from_version) {
            return Err(CoreError::migration_failed(format!(
                "migration from version {} already registered",
                step.from_version
            )));
        }
        self.steps.insert(step.from_version, step);
        Ok(())
    }

    /// Returns registered steps in version order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.steps
            .values()
            .map(|s| MigrationInfo {
                from_version: s.from_version,
                name: s.name.clone(),
            })
            .collect()
    }

    /// Returns true if no steps are registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Checks that steps cover `1..current` without gaps and go no further.
    pub fn validate(&self, current: SchemaVersion) -> CoreResult<()> {
        for version in 1..current {
            if !self.steps.contains_key(&version) {
                return Err(CoreError::migration_failed(format!(
                    "migration version gap: no step from {} to {}",
                    version,
                    version + 1
                )));
            }
        }
        if let Some(version) = self.steps.keys().find(|v| **v >= current) {
            return Err(CoreError::migration_failed(format!(
                "step from version {version} goes past current version {current}"
            )));
        }
        Ok(())
    }

    /// Upgrades a payload from `from` to `to`, strictly in sequence.
    pub fn upgrade(
        &self,
        entity_type: EntityType,
        payload: Value,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> CoreResult<Value> {
        if from > to {
            return Err(CoreError::migration_failed(format!(
                "{entity_type} record has schema version {from}, newer than {to}"
            )));
        }
        let mut fields = match payload {
            Value::Object(fields) => fields,
            _ => {
                return Err(CoreError::migration_failed(format!(
                    "{entity_type} payload is not an object"
                )))
            }
        };

        for version in from..to {
            let step = self.steps.get(&version).ok_or_else(|| {
                CoreError::migration_failed(format!(
                    "no {entity_type} migration from version {} to {}",
                    version,
                    version + 1
                ))
            })?;
            step.apply(&mut fields).map_err(|message| {
                CoreError::migration_failed(format!(
                    "{entity_type} step '{}' ({} -> {}) failed: {message}",
                    step.name,
                    step.from_version,
                    step.to_version()
                ))
            })?;
        }
        Ok(Value::Object(fields))
    }
}
