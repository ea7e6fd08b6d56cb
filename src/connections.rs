//! Connection records and the collaborators that own them.
//!
//! The host never owns connection configuration. It reads it through a
//! [`ConnectionRegistry`] and resolves how to launch an integration type
//! through a [`ModuleCatalog`]. In-memory implementations of both are
//! provided for the binary and for tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// Opaque, stable connection id.
pub type ConnectionId = String;

/// Reserved id of the host's own pseudo-connection.
pub const INTERNAL_CONNECTION_ID: &str = "internal";

fn default_true() -> bool {
    true
}

/// One configured connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection id.
    pub id: ConnectionId,
    /// Integration type id, resolved through the module catalog.
    pub instance_type: String,
    /// Display label, also the variable prefix.
    pub label: String,
    /// Disabled connections are never started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Integration-defined configuration.
    #[serde(default)]
    pub config: Value,
    /// Last upgrade script index applied.
    #[serde(default)]
    pub last_upgrade_index: Option<i64>,
}

/// Source of truth for connection configuration.
pub trait ConnectionRegistry: Send + Sync {
    /// Look up one connection.
    fn get(&self, id: &str) -> Option<ConnectionConfig>;

    /// Every known connection id.
    fn ids(&self) -> Vec<ConnectionId>;

    /// Insert or replace a connection.
    fn upsert(&self, connection: ConnectionConfig);

    /// Remove a connection, returning its last record.
    fn remove(&self, id: &str) -> Option<ConnectionConfig>;

    /// Persist a new configuration blob. Returns false for unknown ids.
    fn save_config(&self, id: &str, config: Value) -> bool;

    /// Persist the last applied upgrade index. Returns false for unknown ids.
    fn set_upgrade_index(&self, id: &str, index: i64) -> bool;

    /// Whether the connection exists and is enabled.
    fn is_enabled(&self, id: &str) -> bool {
        self.get(id).is_some_and(|c| c.enabled)
    }

    /// Display label of a connection.
    fn label(&self, id: &str) -> Option<String> {
        self.get(id).map(|c| c.label)
    }

    /// Find a connection id by label.
    fn id_for_label(&self, label: &str) -> Option<ConnectionId> {
        self.ids()
            .into_iter()
            .find(|id| self.label(id).as_deref() == Some(label))
    }
}

/// Connection registry held in memory.
#[derive(Debug, Default)]
pub struct MemoryConnectionRegistry {
    /// Connections by id.
    connections: RwLock<BTreeMap<ConnectionId, ConnectionConfig>>,
}

impl MemoryConnectionRegistry {
    /// Create a registry holding the given connections.
    pub fn new(connections: impl IntoIterator<Item = ConnectionConfig>) -> Self {
        Self {
            connections: RwLock::new(
                connections
                    .into_iter()
                    .map(|c| (c.id.clone(), c))
                    .collect(),
            ),
        }
    }
}

impl ConnectionRegistry for MemoryConnectionRegistry {
    fn get(&self, id: &str) -> Option<ConnectionConfig> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn upsert(&self, connection: ConnectionConfig) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.id.clone(), connection);
    }

    fn remove(&self, id: &str) -> Option<ConnectionConfig> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    fn save_config(&self, id: &str, config: Value) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get_mut(id) {
            Some(connection) => {
                connection.config = config;
                true
            }
            None => false,
        }
    }

    fn set_upgrade_index(&self, id: &str, index: i64) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get_mut(id) {
            Some(connection) => {
                connection.last_upgrade_index = Some(index);
                true
            }
            None => false,
        }
    }
}

/// How to launch one integration type.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    /// Integration type id.
    pub instance_type: String,
    /// Program to run.
    pub command: String,
    /// Arguments placed before the entry point.
    pub args: Vec<String>,
    /// Entry point passed to the program and in `ENTRY_POINT`.
    pub entry_point: Option<PathBuf>,
    /// Manifest passed in `MANIFEST_PATH`.
    pub manifest_path: Option<PathBuf>,
    /// Working directory of the process.
    pub working_dir: Option<PathBuf>,
}

/// Catalog of installed integration types.
pub trait ModuleCatalog: Send + Sync {
    /// Launch information for an integration type.
    fn module(&self, instance_type: &str) -> Option<ModuleInfo>;
}

/// Module catalog with a fixed set of entries.
#[derive(Debug, Default, Clone)]
pub struct StaticModuleCatalog {
    /// Modules by integration type id.
    modules: HashMap<String, ModuleInfo>,
}

impl StaticModuleCatalog {
    /// Create a catalog from module entries.
    pub fn new(modules: impl IntoIterator<Item = ModuleInfo>) -> Self {
        Self {
            modules: modules
                .into_iter()
                .map(|m| (m.instance_type.clone(), m))
                .collect(),
        }
    }
}

impl ModuleCatalog for StaticModuleCatalog {
    fn module(&self, instance_type: &str) -> Option<ModuleInfo> {
        self.modules.get(instance_type).cloned()
    }
}
