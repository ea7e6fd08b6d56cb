//! Configuration system for surface-host.
//!
//! TOML configuration loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `/etc/surface-host/config.toml`
//! 3. User config: `~/.config/surface-host/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Scalars** (timeouts, log_level, listen) are **overridden** when set
//! - **Modules** are merged by type id, later entries replace earlier ones
//! - **Connections** are merged by connection id
//!
//! ```toml
//! [modules.generic-osc]
//! command = "node"
//! entry_point = "/opt/modules/generic-osc/main.js"
//!
//! [[connections]]
//! id = "osc-1"
//! instance_type = "generic-osc"
//! label = "osc1"
//! config = { host = "10.0.0.5", port = 53000 }
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, DEFAULT_CONFIG, GeneralConfig, HostSection, HttpConfig, ModuleConfig, PagesConfig,
};
