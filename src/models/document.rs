use crate::error::{SyncError, SyncResult};
use crate::models::field::{FieldDefinition, FieldKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name under which the signup stage tag is stored remotely.
pub const STAGE_FIELD: &str = "signupStage";

/// Untyped profile document keyed by field name.
///
/// Fields are never removed; a merge overwrites the keys present in the
/// update and leaves everything else alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileDocument {
    fields: Map<String, Value>,
}

impl ProfileDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the serialized field values an edit screen hands over.
    pub fn from_value(value: Value) -> SyncResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Null => Ok(Self::default()),
            other => Err(SyncError::InvalidDocument(format!(
                "expected an object of field values, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    pub fn merge(&mut self, update: &ProfileDocument) {
        for (key, value) in &update.fields {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Looks a field up and checks its stored value against the declared kind.
    ///
    /// `Ok(None)` means the field is absent (or null).
    pub fn typed_value(&self, field: &FieldDefinition) -> SyncResult<Option<&Value>> {
        let Some(value) = self.get(&field.name) else {
            return Ok(None);
        };

        let matches = match field.kind {
            FieldKind::Text => value.is_string(),
            FieldKind::List(_) => value.is_array(),
            FieldKind::Geopoint => true,
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Number => value.is_number(),
        };

        if matches {
            Ok(Some(value))
        } else {
            Err(SyncError::SchemaMismatch {
                field: field.name.clone(),
                expected: field.kind.label(),
            })
        }
    }

    pub fn stage_tag(&self) -> Option<&str> {
        self.get(STAGE_FIELD).and_then(Value::as_str)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
