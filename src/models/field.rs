use serde::{Deserialize, Serialize};

/// How a list-valued field earns credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListPolicy {
    /// Partial credit per element, capped at the field's weight.
    Counted,
    /// Full credit when non-empty, nothing otherwise.
    AnyOrNone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "policy", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    List(ListPolicy),
    Geopoint,
    Boolean,
    Number,
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::List(_) => "list",
            FieldKind::Geopoint => "geopoint",
            FieldKind::Boolean => "boolean",
            FieldKind::Number => "number",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub display_name: String,
    pub kind: FieldKind,
    pub required_weight: u32,
    /// Shown when the field earns nothing, e.g. "Add your first name".
    pub prompt: String,
}

impl FieldDefinition {
    pub fn new(name: &str, display_name: &str, kind: FieldKind, required_weight: u32, prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            kind,
            required_weight,
            prompt: prompt.to_string(),
        }
    }

    pub fn text(name: &str, display_name: &str, prompt: &str) -> Self {
        Self::new(name, display_name, FieldKind::Text, 1, prompt)
    }
}
