//! Configuration schema definitions.
//!
//! Mirrors the TOML layout:
//!
//! ```toml
//! [general]            # log level
//! [host]               # socket path, timeouts, accepted API versions
//! [http]               # HTTP bridge
//! [pages]              # page count
//! [modules.<type>]     # how to launch an integration type
//! [[connections]]      # configured connections
//! ```

use semver::VersionReq;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::connections::{ConnectionConfig, ModuleInfo};
use crate::host::HostConfig;

/// Defaults compiled into the binary.
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Connection host settings.
    #[serde(default)]
    pub host: HostSection,

    /// HTTP bridge settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Page settings.
    #[serde(default)]
    pub pages: PagesConfig,

    /// Integration types by id.
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,

    /// Configured connections.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Config {
    /// Parse the embedded defaults.
    pub fn embedded() -> Result<Self, ConfigError> {
        toml::from_str(DEFAULT_CONFIG).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<embedded:default.toml>"),
            source: e,
        })
    }

    /// Merge another config into this one.
    ///
    /// Scalars are overridden when set, modules merge by type id and
    /// connections merge by connection id.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.host.merge(other.host);
        self.http.merge(other.http);
        self.pages.merge(other.pages);

        for (name, module) in other.modules {
            self.modules.insert(name, module);
        }

        for connection in other.connections {
            match self.connections.iter_mut().find(|c| c.id == connection.id) {
                Some(existing) => *existing = connection,
                None => self.connections.push(connection),
            }
        }
    }

    /// Check values that cannot be validated by parsing alone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidApiVersion`] for a bad version range,
    /// [`ConfigError::DuplicateConnection`] when ids collide, and
    /// [`ConfigError::InvalidValue`] for anything else.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.host.api_version.is_empty() {
            self.api_version()?;
        }
        if self.http.is_enabled() {
            self.http.listen_addr()?;
        }
        if let Some(path) = &self.host.socket_path
            && (path.as_os_str().is_empty() || path.file_name().is_none())
        {
            return Err(ConfigError::InvalidValue {
                field: "host.socket_path".to_string(),
                message: format!("'{}' is not a socket file path", path.display()),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for connection in &self.connections {
            if connection.id.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "connections.id".to_string(),
                    message: "connection id must not be empty".to_string(),
                });
            }
            if !seen.insert(connection.id.as_str()) {
                return Err(ConfigError::DuplicateConnection(connection.id.clone()));
            }
        }
        Ok(())
    }

    fn api_version(&self) -> Result<VersionReq, ConfigError> {
        VersionReq::parse(&self.host.api_version).map_err(|source| ConfigError::InvalidApiVersion {
            range: self.host.api_version.clone(),
            source,
        })
    }

    /// Host settings, falling back to [`HostConfig::default`] for unset values.
    pub fn host_config(&self) -> Result<HostConfig, ConfigError> {
        let defaults = HostConfig::default();
        let millis = |value: u64, fallback: Duration| {
            if value == 0 {
                fallback
            } else {
                Duration::from_millis(value)
            }
        };
        Ok(HostConfig {
            socket_path: self
                .host
                .socket_path
                .clone()
                .unwrap_or(defaults.socket_path),
            ipc_timeout: millis(self.host.ipc_timeout_ms, defaults.ipc_timeout),
            kill_timeout: millis(self.host.kill_timeout_ms, defaults.kill_timeout),
            restart_delay: millis(self.host.restart_delay_ms, defaults.restart_delay),
            register_timeout: millis(self.host.register_timeout_ms, defaults.register_timeout),
            api_version: if self.host.api_version.is_empty() {
                defaults.api_version
            } else {
                self.api_version()?
            },
        })
    }

    /// Launch descriptions of every integration type.
    pub fn module_infos(&self) -> Vec<ModuleInfo> {
        self.modules
            .iter()
            .map(|(instance_type, module)| ModuleInfo {
                instance_type: instance_type.clone(),
                command: module.command.clone(),
                args: module.args.clone(),
                entry_point: module.entry_point.clone(),
                manifest_path: module.manifest_path.clone(),
                working_dir: module.working_dir.clone(),
            })
            .collect()
    }

    /// Connections whose type has no `[modules]` entry.
    pub fn connections_without_module(&self) -> Vec<&ConnectionConfig> {
        self.connections
            .iter()
            .filter(|c| !self.modules.contains_key(&c.instance_type))
            .collect()
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// `[host]` settings. Zero and empty values mean unset.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HostSection {
    /// Socket connection processes dial.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Reply window for calls to connections.
    #[serde(default)]
    pub ipc_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL.
    #[serde(default)]
    pub kill_timeout_ms: u64,

    /// Pause before restarting a crashed process.
    #[serde(default)]
    pub restart_delay_ms: u64,

    /// How long a new channel may take to register.
    #[serde(default)]
    pub register_timeout_ms: u64,

    /// Accepted API versions as a semver requirement.
    #[serde(default)]
    pub api_version: String,
}

impl HostSection {
    fn merge(&mut self, other: HostSection) {
        if other.socket_path.is_some() {
            self.socket_path = other.socket_path;
        }
        if other.ipc_timeout_ms != 0 {
            self.ipc_timeout_ms = other.ipc_timeout_ms;
        }
        if other.kill_timeout_ms != 0 {
            self.kill_timeout_ms = other.kill_timeout_ms;
        }
        if other.restart_delay_ms != 0 {
            self.restart_delay_ms = other.restart_delay_ms;
        }
        if other.register_timeout_ms != 0 {
            self.register_timeout_ms = other.register_timeout_ms;
        }
        if !other.api_version.is_empty() {
            self.api_version = other.api_version;
        }
    }
}

/// `[http]` settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HttpConfig {
    /// Whether to run the bridge.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Listen address.
    #[serde(default)]
    pub listen: String,
}

impl HttpConfig {
    fn merge(&mut self, other: HttpConfig) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if !other.listen.is_empty() {
            self.listen = other.listen;
        }
    }

    /// Whether the bridge should run.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| ConfigError::InvalidValue {
            field: "http.listen".to_string(),
            message: format!("'{}' is not a socket address", self.listen),
        })
    }
}

/// `[pages]` settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PagesConfig {
    /// Number of pages.
    #[serde(default)]
    pub count: u32,
}

impl PagesConfig {
    fn merge(&mut self, other: PagesConfig) {
        if other.count != 0 {
            self.count = other.count;
        }
    }
}

/// `[modules.<type>]`: how to launch one integration type.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ModuleConfig {
    /// Program to run.
    pub command: String,

    /// Arguments placed before the entry point.
    #[serde(default)]
    pub args: Vec<String>,

    /// Entry point passed to the program.
    #[serde(default)]
    pub entry_point: Option<PathBuf>,

    /// Manifest passed to the process.
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    /// Working directory of the process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_toml_parses() {
        let config = Config::embedded().unwrap();

        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.host.ipc_timeout_ms, 5000);
        assert!(config.http.is_enabled());
        assert_eq!(config.http.listen_addr().unwrap().port(), 8800);
        assert_eq!(config.pages.count, 99);
        assert!(config.connections.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let toml_str = r#"
            [host]
            socket_path = "/tmp/surface/connections.sock"

            [modules.generic-osc]
            command = "node"
            args = ["--enable-source-maps"]
            entry_point = "/opt/modules/generic-osc/main.js"

            [[connections]]
            id = "osc-1"
            instance_type = "generic-osc"
            label = "osc1"
            config = { host = "10.0.0.5", port = 53000 }

            [[connections]]
            id = "osc-2"
            instance_type = "missing"
            label = "osc2"
            enabled = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        let osc = &config.connections[0];
        assert!(osc.enabled);
        assert_eq!(osc.config["port"], 53000);
        assert!(!config.connections[1].enabled);

        let modules = config.module_infos();
        assert_eq!(modules[0].args, vec!["--enable-source-maps"]);
        assert_eq!(config.connections_without_module()[0].id, "osc-2");

        let host = config.host_config().unwrap();
        assert_eq!(host.socket_path, PathBuf::from("/tmp/surface/connections.sock"));
        assert_eq!(host.ipc_timeout, HostConfig::default().ipc_timeout);
    }

    #[test]
    fn test_merge_connections_by_id() {
        let mut base: Config = toml::from_str(
            r#"
            [[connections]]
            id = "a"
            instance_type = "x"
            label = "first"

            [[connections]]
            id = "b"
            instance_type = "x"
            label = "b"
        "#,
        )
        .unwrap();
        let overlay: Config = toml::from_str(
            r#"
            [http]
            enabled = false

            [[connections]]
            id = "a"
            instance_type = "x"
            label = "second"
        "#,
        )
        .unwrap();

        base.http.enabled = Some(true);
        base.merge(overlay);
        assert_eq!(base.connections.len(), 2);
        assert_eq!(base.connections[0].label, "second");
        assert!(!base.http.is_enabled());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::embedded().unwrap();
        config.host.api_version = "not a range".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidApiVersion { .. })
        ));

        let mut config = Config::embedded().unwrap();
        config.http.listen = "localhost".to_string();
        assert!(config.validate().is_err());
        config.http.enabled = Some(false);
        config.validate().unwrap();

        let config: Config = toml::from_str(
            r#"
            [[connections]]
            id = "a"
            instance_type = "x"
            label = "a"

            [[connections]]
            id = "a"
            instance_type = "x"
            label = "again"
        "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateConnection(ref id)) if id == "a"
        ));
    }

    #[test]
    fn test_validate_api_version_without_defaults() {
        let config: Config = toml::from_str("[host]\n").unwrap();
        assert!(config.host.api_version.is_empty());
        config.validate().unwrap();

        let config: Config = toml::from_str("[host]\napi_version = \"nope\"\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidApiVersion { ref range, .. }) if range == "nope"
        ));
    }
}
