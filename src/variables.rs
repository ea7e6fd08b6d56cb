//! Variable values published by connections.
//!
//! Values are keyed by connection label and variable name and referenced
//! in text as `$(label:name)`. Custom variables live under the `custom`
//! label. Every change is published as the list of fully qualified names
//! (`label:name`) that changed so the host can fan it out to connections.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

/// Label under which custom variables are stored.
pub const CUSTOM_LABEL: &str = "custom";

/// Replacement for references to unknown variables.
pub const MISSING_VALUE: &str = "$NA";

/// Capacity of the change broadcast.
const EVENT_CAPACITY: usize = 256;

/// Text after variable substitution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedText {
    /// Text with references replaced.
    pub text: String,
    /// Every `label:name` referenced, in order of appearance.
    pub variable_ids: Vec<String>,
}

/// Variable storage used by the host.
pub trait VariableStore: Send + Sync {
    /// Merge values for one label. `null` removes a value.
    ///
    /// Returns the fully qualified names that actually changed.
    fn set_values(&self, label: &str, values: Vec<(String, Value)>) -> Vec<String>;

    /// Current value of a variable.
    fn get(&self, label: &str, name: &str) -> Option<Value>;

    /// Substitute `$(label:name)` references.
    fn parse(&self, text: &str) -> ParsedText;

    /// Drop every value of a label.
    fn forget_label(&self, label: &str) -> Vec<String>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<Vec<String>>;

    /// Set a custom variable.
    fn set_custom(&self, name: &str, value: Value) -> bool {
        !self
            .set_values(CUSTOM_LABEL, vec![(name.to_string(), value)])
            .is_empty()
    }
}

/// Variable store held in memory.
pub struct MemoryVariables {
    /// Values by label, then name.
    values: RwLock<HashMap<String, HashMap<String, Value>>>,
    /// Change notifications.
    changes: broadcast::Sender<Vec<String>>,
}

impl Default for MemoryVariables {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVariables {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn publish(&self, changed: &[String]) {
        if !changed.is_empty() {
            let _ = self.changes.send(changed.to_vec());
        }
    }
}

impl VariableStore for MemoryVariables {
    fn set_values(&self, label: &str, values: Vec<(String, Value)>) -> Vec<String> {
        let mut changed = Vec::new();
        {
            let mut all = self.values.write().unwrap_or_else(PoisonError::into_inner);
            let entries = all.entry(label.to_string()).or_default();
            for (name, value) in values {
                let differs = if value.is_null() {
                    entries.remove(&name).is_some()
                } else if entries.get(&name) != Some(&value) {
                    entries.insert(name.clone(), value);
                    true
                } else {
                    false
                };
                if differs {
                    changed.push(format!("{}:{}", label, name));
                }
            }
        }
        self.publish(&changed);
        changed
    }

    fn get(&self, label: &str, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .and_then(|entries| entries.get(name))
            .cloned()
    }

    fn parse(&self, text: &str) -> ParsedText {
        let mut parsed = ParsedText::default();
        let mut rest = text;

        while let Some(start) = rest.find("$(") {
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                break;
            };
            let reference = &after[..end];
            parsed.text.push_str(&rest[..start]);

            match reference.split_once(':') {
                Some((label, name)) if !label.is_empty() && !name.is_empty() => {
                    parsed.variable_ids.push(reference.to_string());
                    match self.get(label, name) {
                        Some(Value::String(s)) => parsed.text.push_str(&s),
                        Some(value) => parsed.text.push_str(&value.to_string()),
                        None => parsed.text.push_str(MISSING_VALUE),
                    }
                }
                _ => {
                    parsed.text.push_str(&rest[start..start + 2 + end + 1]);
                }
            }
            rest = &after[end + 1..];
        }
        parsed.text.push_str(rest);
        parsed
    }

    fn forget_label(&self, label: &str) -> Vec<String> {
        let removed = self
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label);
        let changed: Vec<String> = removed
            .map(|entries| entries.into_keys().map(|name| format!("{}:{}", label, name)).collect())
            .unwrap_or_default();
        self.publish(&changed);
        changed
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_values_reports_changes() {
        let store = MemoryVariables::new();
        let changed = store.set_values(
            "osc1",
            vec![("volume".to_string(), json!(5)), ("name".to_string(), json!("Main"))],
        );
        assert_eq!(changed, vec!["osc1:volume".to_string(), "osc1:name".to_string()]);

        let again = store.set_values("osc1", vec![("volume".to_string(), json!(5))]);
        assert!(again.is_empty());

        let cleared = store.set_values("osc1", vec![("volume".to_string(), Value::Null)]);
        assert_eq!(cleared, vec!["osc1:volume".to_string()]);
        assert!(store.get("osc1", "volume").is_none());
    }

    #[test]
    fn test_parse_substitutes_references() {
        let store = MemoryVariables::new();
        store.set_values(
            "osc1",
            vec![("volume".to_string(), json!(5)), ("name".to_string(), json!("Main"))],
        );

        let parsed = store.parse("$(osc1:name) at $(osc1:volume), $(osc1:missing)");
        assert_eq!(parsed.text, "Main at 5, $NA");
        assert_eq!(
            parsed.variable_ids,
            vec!["osc1:name".to_string(), "osc1:volume".to_string(), "osc1:missing".to_string()]
        );
    }

    #[test]
    fn test_parse_leaves_malformed_references() {
        let store = MemoryVariables::new();
        let parsed = store.parse("cost $(5) and $(unclosed");
        assert_eq!(parsed.text, "cost $(5) and $(unclosed");
        assert!(parsed.variable_ids.is_empty());
    }

    #[test]
    fn test_custom_variables() {
        let store = MemoryVariables::new();
        assert!(store.set_custom("scene", json!("intro")));
        assert!(!store.set_custom("scene", json!("intro")));
        assert_eq!(store.parse("$(custom:scene)").text, "intro");
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let store = MemoryVariables::new();
        let mut changes = store.subscribe();
        store.set_values("osc1", vec![("volume".to_string(), json!(1))]);
        assert_eq!(changes.recv().await.unwrap(), vec!["osc1:volume".to_string()]);

        let forgotten = store.forget_label("osc1");
        assert_eq!(forgotten, vec!["osc1:volume".to_string()]);
        assert_eq!(changes.recv().await.unwrap(), vec!["osc1:volume".to_string()]);
    }
}
