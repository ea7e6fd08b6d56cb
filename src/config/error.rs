//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file exists but could not be read.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration file is not valid TOML for the schema.
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A setting has a value the host cannot use.
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue {
        /// Dotted setting name, e.g. `http.listen`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// `host.api_version` is not a semver range.
    #[error("Invalid API version range '{range}': {source}")]
    InvalidApiVersion {
        /// The configured range.
        range: String,
        /// Parser error.
        source: semver::Error,
    },

    /// Two `[[connections]]` entries share an id.
    #[error("Duplicate connection id '{0}'")]
    DuplicateConnection(String),

    /// No per-user config directory on this system.
    #[error("Could not determine the user config directory")]
    NoHomeDirectory,
}
