//! Definition types published by connections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Something stored in a per-connection catalog under a key.
pub trait Definition: Clone + PartialEq {
    /// Catalog key.
    fn key(&self) -> &str;
}

/// One configurable option of an action or feedback type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionField {
    /// Option id within the options map.
    pub id: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Input type (`textinput`, `number`, `dropdown`, ...).
    #[serde(rename = "type")]
    pub field_type: String,
    /// Value used when a new instance is created.
    #[serde(default)]
    pub default: Option<Value>,
}

/// Build an options map from field defaults.
pub fn default_options(fields: &[OptionField]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|field| field.default.clone().map(|value| (field.id.clone(), value)))
        .collect()
}

/// An action type a connection offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    /// Action type id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Option fields.
    #[serde(default)]
    pub options: Vec<OptionField>,
    /// Whether the connection can learn option values.
    #[serde(default)]
    pub has_learn: bool,
}

impl Definition for ActionDefinition {
    fn key(&self) -> &str {
        &self.id
    }
}

/// How a feedback's value is applied to a style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    /// Value is a boolean; when true the instance (or default) style applies.
    Boolean,
    /// Value is a partial style object merged directly.
    Advanced,
}

/// A feedback type a connection offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackDefinition {
    /// Feedback type id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Boolean or advanced.
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Style applied by a true boolean feedback without its own style.
    #[serde(default)]
    pub default_style: Option<Map<String, Value>>,
    /// Option fields.
    #[serde(default)]
    pub options: Vec<OptionField>,
    /// Whether the connection can learn option values.
    #[serde(default)]
    pub has_learn: bool,
    /// Whether the UI offers an invert toggle.
    #[serde(default)]
    pub show_invert: bool,
}

impl Definition for FeedbackDefinition {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A variable a connection publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    /// Variable name within the connection.
    #[serde(alias = "variableId")]
    pub name: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
}

impl Definition for VariableDefinition {
    fn key(&self) -> &str {
        &self.name
    }
}

/// A ready-made button a connection offers.
///
/// Only the identifying fields are interpreted; the rest is kept as-is for
/// the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetDefinition {
    /// Preset id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Grouping category.
    #[serde(default)]
    pub category: String,
    /// Everything else.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Definition for PresetDefinition {
    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_options_skips_fields_without_default() {
        let fields: Vec<OptionField> = serde_json::from_value(json!([
            { "id": "path", "label": "Path", "type": "textinput", "default": "/go" },
            { "id": "value", "label": "Value", "type": "number" },
            { "id": "enabled", "type": "checkbox", "default": true }
        ]))
        .unwrap();

        let options = default_options(&fields);
        assert_eq!(options.len(), 2);
        assert_eq!(options["path"], json!("/go"));
        assert_eq!(options["enabled"], json!(true));
    }

    #[test]
    fn test_feedback_definition_from_wire() {
        let def: FeedbackDefinition = serde_json::from_value(json!({
            "id": "playing",
            "name": "Playing",
            "type": "boolean",
            "defaultStyle": { "bgcolor": 65280 },
            "showInvert": true
        }))
        .unwrap();
        assert_eq!(def.kind, FeedbackKind::Boolean);
        assert!(def.show_invert);
        assert_eq!(def.default_style.unwrap()["bgcolor"], json!(65280));
    }

    #[test]
    fn test_preset_keeps_unknown_fields() {
        let preset: PresetDefinition = serde_json::from_value(json!({
            "id": "go",
            "name": "GO",
            "category": "Transport",
            "style": { "text": "GO" }
        }))
        .unwrap();
        assert_eq!(preset.key(), "go");
        assert_eq!(preset.body["style"]["text"], json!("GO"));
    }
}
