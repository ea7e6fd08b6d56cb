//! Error types for the connection host.

use thiserror::Error;

use crate::ipc::IpcError;

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The API version is not valid semver.
    #[error("Invalid API version '{0}'")]
    InvalidVersion(String),

    /// The API version is outside the supported range.
    #[error("Unsupported API version {version} (host supports {supported})")]
    UnsupportedVersion {
        /// Version claimed by the process.
        version: String,
        /// Range the host accepts.
        supported: String,
    },

    /// No such connection, or it is not being started.
    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),

    /// A channel is already registered for the connection.
    #[error("Connection '{0}' already has a registered channel")]
    AlreadyRegistered(String),

    /// The token does not match the one issued at start.
    #[error("Token mismatch for connection '{0}'")]
    TokenMismatch(String),
}

/// Errors from calls made through a connection handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The channel call failed.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// The instance belongs to a different connection.
    #[error("Instance belongs to connection '{actual}', not '{expected}'")]
    WrongConnection {
        /// Connection of the handler.
        expected: String,
        /// Connection of the instance.
        actual: String,
    },

    /// The connection did not report an HTTP handler.
    #[error("Connection '{0}' has no HTTP handler")]
    NoHttpHandler(String),
}

impl HandlerError {
    /// Whether the underlying call timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::Ipc(e) if e.is_timeout())
    }
}

/// Errors from host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Registration refused.
    #[error("Registration rejected: {0}")]
    Register(#[from] RegisterError),

    /// Handler call failed.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Process could not be supervised.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// The integration type is not installed.
    #[error("Unknown module '{0}'")]
    UnknownModule(String),
}
