//! Per-connection catalogs with diffing.
//!
//! Each `set*Definitions` message replaces a connection's whole catalog.
//! The registry compares the new catalog to the previous one and
//! broadcasts only what was added, changed or removed.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{
    ActionDefinition, Definition, FeedbackDefinition, PresetDefinition, VariableDefinition,
    default_options,
};
use crate::connections::ConnectionId;

/// Capacity of the change broadcast.
const EVENT_CAPACITY: usize = 256;

/// Difference between two versions of a catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogDiff<T> {
    /// Entries whose key was not present before.
    pub added: Vec<T>,
    /// Entries whose content changed.
    pub changed: Vec<T>,
    /// Keys no longer present.
    pub removed: Vec<String>,
}

impl<T> Default for CatalogDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            changed: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T> CatalogDiff<T> {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Catalog change notification.
#[derive(Debug, Clone)]
pub enum DefinitionsEvent {
    /// Action catalog changed.
    Actions {
        /// Owning connection.
        connection_id: ConnectionId,
        /// What changed.
        diff: CatalogDiff<ActionDefinition>,
    },
    /// Feedback catalog changed.
    Feedbacks {
        /// Owning connection.
        connection_id: ConnectionId,
        /// What changed.
        diff: CatalogDiff<FeedbackDefinition>,
    },
    /// Variable catalog changed.
    Variables {
        /// Owning connection.
        connection_id: ConnectionId,
        /// What changed.
        diff: CatalogDiff<VariableDefinition>,
    },
    /// Preset catalog changed.
    Presets {
        /// Owning connection.
        connection_id: ConnectionId,
        /// What changed.
        diff: CatalogDiff<PresetDefinition>,
    },
    /// Every catalog of a connection was dropped.
    Forgotten {
        /// The connection.
        connection_id: ConnectionId,
    },
}

type Catalogs<T> = RwLock<HashMap<ConnectionId, BTreeMap<String, T>>>;

/// Catalogs of every connection.
pub struct DefinitionsRegistry {
    actions: Catalogs<ActionDefinition>,
    feedbacks: Catalogs<FeedbackDefinition>,
    variables: Catalogs<VariableDefinition>,
    presets: Catalogs<PresetDefinition>,
    events: broadcast::Sender<DefinitionsEvent>,
}

impl Default for DefinitionsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            actions: RwLock::new(HashMap::new()),
            feedbacks: RwLock::new(HashMap::new()),
            variables: RwLock::new(HashMap::new()),
            presets: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to catalog changes.
    pub fn subscribe(&self) -> broadcast::Receiver<DefinitionsEvent> {
        self.events.subscribe()
    }

    /// Replace a connection's action catalog.
    pub fn set_action_definitions(
        &self,
        connection_id: &str,
        definitions: Vec<ActionDefinition>,
    ) -> CatalogDiff<ActionDefinition> {
        let diff = replace_catalog(&self.actions, connection_id, definitions);
        if !diff.is_empty() {
            self.publish(DefinitionsEvent::Actions {
                connection_id: connection_id.to_string(),
                diff: diff.clone(),
            });
        }
        diff
    }

    /// Replace a connection's feedback catalog.
    pub fn set_feedback_definitions(
        &self,
        connection_id: &str,
        definitions: Vec<FeedbackDefinition>,
    ) -> CatalogDiff<FeedbackDefinition> {
        let diff = replace_catalog(&self.feedbacks, connection_id, definitions);
        if !diff.is_empty() {
            self.publish(DefinitionsEvent::Feedbacks {
                connection_id: connection_id.to_string(),
                diff: diff.clone(),
            });
        }
        diff
    }

    /// Replace a connection's variable catalog.
    pub fn set_variable_definitions(
        &self,
        connection_id: &str,
        definitions: Vec<VariableDefinition>,
    ) -> CatalogDiff<VariableDefinition> {
        let diff = replace_catalog(&self.variables, connection_id, definitions);
        if !diff.is_empty() {
            self.publish(DefinitionsEvent::Variables {
                connection_id: connection_id.to_string(),
                diff: diff.clone(),
            });
        }
        diff
    }

    /// Replace a connection's preset catalog.
    pub fn set_preset_definitions(
        &self,
        connection_id: &str,
        definitions: Vec<PresetDefinition>,
    ) -> CatalogDiff<PresetDefinition> {
        let diff = replace_catalog(&self.presets, connection_id, definitions);
        if !diff.is_empty() {
            self.publish(DefinitionsEvent::Presets {
                connection_id: connection_id.to_string(),
                diff: diff.clone(),
            });
        }
        diff
    }

    /// Look up one action type.
    pub fn action_definition(&self, connection_id: &str, action_type: &str) -> Option<ActionDefinition> {
        lookup(&self.actions, connection_id, action_type)
    }

    /// Look up one feedback type.
    pub fn feedback_definition(
        &self,
        connection_id: &str,
        feedback_type: &str,
    ) -> Option<FeedbackDefinition> {
        lookup(&self.feedbacks, connection_id, feedback_type)
    }

    /// All action types of a connection.
    pub fn action_definitions(&self, connection_id: &str) -> Vec<ActionDefinition> {
        list(&self.actions, connection_id)
    }

    /// All feedback types of a connection.
    pub fn feedback_definitions(&self, connection_id: &str) -> Vec<FeedbackDefinition> {
        list(&self.feedbacks, connection_id)
    }

    /// All variables of a connection.
    pub fn variable_definitions(&self, connection_id: &str) -> Vec<VariableDefinition> {
        list(&self.variables, connection_id)
    }

    /// All presets of a connection.
    pub fn preset_definitions(&self, connection_id: &str) -> Vec<PresetDefinition> {
        list(&self.presets, connection_id)
    }

    /// Default options for a new action instance.
    pub fn default_action_options(
        &self,
        connection_id: &str,
        action_type: &str,
    ) -> Option<Map<String, Value>> {
        self.action_definition(connection_id, action_type)
            .map(|def| default_options(&def.options))
    }

    /// Default options for a new feedback instance.
    pub fn default_feedback_options(
        &self,
        connection_id: &str,
        feedback_type: &str,
    ) -> Option<Map<String, Value>> {
        self.feedback_definition(connection_id, feedback_type)
            .map(|def| default_options(&def.options))
    }

    /// Drop every catalog of a connection.
    pub fn forget_connection(&self, connection_id: &str) {
        let mut removed = false;
        removed |= forget(&self.actions, connection_id);
        removed |= forget(&self.feedbacks, connection_id);
        removed |= forget(&self.variables, connection_id);
        removed |= forget(&self.presets, connection_id);
        if removed {
            debug!("Forgot definitions of connection {}", connection_id);
            self.publish(DefinitionsEvent::Forgotten {
                connection_id: connection_id.to_string(),
            });
        }
    }

    fn publish(&self, event: DefinitionsEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn replace_catalog<T: Definition>(
    catalogs: &Catalogs<T>,
    connection_id: &str,
    definitions: Vec<T>,
) -> CatalogDiff<T> {
    let next: BTreeMap<String, T> = definitions
        .into_iter()
        .map(|def| (def.key().to_string(), def))
        .collect();

    let mut catalogs = catalogs.write().unwrap_or_else(PoisonError::into_inner);
    let previous = catalogs.remove(connection_id).unwrap_or_default();

    let mut diff = CatalogDiff::default();
    for (key, def) in &next {
        match previous.get(key) {
            None => diff.added.push(def.clone()),
            Some(old) if old != def => diff.changed.push(def.clone()),
            Some(_) => {}
        }
    }
    diff.removed = previous
        .keys()
        .filter(|key| !next.contains_key(*key))
        .cloned()
        .collect();

    catalogs.insert(connection_id.to_string(), next);
    diff
}

fn lookup<T: Definition>(catalogs: &Catalogs<T>, connection_id: &str, key: &str) -> Option<T> {
    catalogs
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(connection_id)
        .and_then(|catalog| catalog.get(key))
        .cloned()
}

fn list<T: Definition>(catalogs: &Catalogs<T>, connection_id: &str) -> Vec<T> {
    catalogs
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(connection_id)
        .map(|catalog| catalog.values().cloned().collect())
        .unwrap_or_default()
}

fn forget<T>(catalogs: &Catalogs<T>, connection_id: &str) -> bool {
    catalogs
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(connection_id)
        .is_some()
}
