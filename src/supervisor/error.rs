//! Error types for process supervision.

use thiserror::Error;

/// Errors from starting or stopping a supervised process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The command could not be resolved to an executable.
    #[error("Command '{command}' not found: {source}")]
    CommandNotFound {
        /// The command as configured.
        command: String,
        /// Lookup failure.
        #[source]
        source: which::Error,
    },

    /// The process could not be spawned.
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// A signal could not be delivered.
    #[error("Failed to send signal: {0}")]
    SignalFailed(#[source] nix::Error),
}
