//! Payload schemas.
//!
//! A schema lists the top-level fields of an entity payload with their
//! kinds. Unknown fields are accepted unless the schema is strict.

use crate::entity::EntityType;
use crate::error::{CoreError, CoreResult};
use serde_json::Value;

/// JSON kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A string.
    String,
    /// Any number.
    Number,
    /// An integer.
    Integer,
    /// A boolean.
    Bool,
    /// An array.
    Array,
    /// An object.
    Object,
    /// Anything.
    Any,
}

impl FieldKind {
    /// Returns true if `value` has this kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Bool => "bool",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Expected kind.
    pub kind: FieldKind,
    /// Required fields must be present and non-null.
    pub required: bool,
}

/// Schema of an entity payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySchema {
    fields: Vec<FieldSpec>,
    strict: bool,
}

impl EntitySchema {
    /// Creates an empty, permissive schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Rejects fields that are not declared.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Returns the declared fields.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Returns the declared field with `name`.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validates a payload.
    pub fn validate(&self, entity_type: EntityType, payload: &Value) -> CoreResult<()> {
        let fields = payload
            .as_object()
            .ok_or_else(|| CoreError::validation(entity_type.as_str(), "payload must be a JSON object"))?;

        for spec in &self.fields {
            match fields.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(CoreError::validation(
                        entity_type.as_str(),
                        format!("missing required field '{}'", spec.name),
                    ));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(CoreError::validation(
                        entity_type.as_str(),
                        format!("field '{}' must be {}", spec.name, spec.kind.name()),
                    ));
                }
                Some(_) => {}
            }
        }

        if self.strict {
            if let Some(name) = fields.keys().find(|name| self.field(name).is_none()) {
                return Err(CoreError::validation(
                    entity_type.as_str(),
                    format!("unknown field '{name}'"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_schema() -> EntitySchema {
        EntitySchema::new()
            .required("name", FieldKind::String)
            .required("started_at", FieldKind::Integer)
            .optional("notes", FieldKind::String)
    }

    #[test]
    fn accepts_valid_payload() {
        let payload = json!({"name": "Quarry", "started_at": 10, "extra": true});
        assert!(session_schema().validate(EntityType::FieldSession, &payload).is_ok());
    }

    #[test]
    fn rejects_missing_and_null_required() {
        let schema = session_schema();
        assert!(schema.validate(EntityType::FieldSession, &json!({"name": "Quarry"})).is_err());
        let err = schema
            .validate(EntityType::FieldSession, &json!({"name": null, "started_at": 1}))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn rejects_wrong_kind() {
        let payload = json!({"name": "Quarry", "started_at": "yesterday"});
        assert!(session_schema().validate(EntityType::FieldSession, &payload).is_err());
    }

    #[test]
    fn optional_null_is_fine() {
        let payload = json!({"name": "Quarry", "started_at": 1, "notes": null});
        assert!(session_schema().validate(EntityType::FieldSession, &payload).is_ok());
    }

    #[test]
    fn rejects_non_object() {
        assert!(session_schema().validate(EntityType::FieldSession, &json!([1, 2])).is_err());
    }

    #[test]
    fn strict_rejects_unknown() {
        let schema = session_schema().strict();
        let payload = json!({"name": "Quarry", "started_at": 1, "extra": 1});
        assert!(schema.validate(EntityType::FieldSession, &payload).is_err());
    }
}
