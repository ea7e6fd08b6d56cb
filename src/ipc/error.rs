//! Error types for the connection IPC layer.

use std::io;
use thiserror::Error;

/// Errors from envelope framing and channel operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// IO error on the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer closed the channel.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Frame exceeds the maximum allowed size.
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    /// A call received no reply within the call window.
    #[error("Call '{verb}' timed out")]
    Timeout {
        /// Verb of the call that timed out.
        verb: String,
    },

    /// The peer replied with an error.
    #[error("Call '{verb}' failed: {message}")]
    Remote {
        /// Verb of the failed call.
        verb: String,
        /// Error message reported by the peer.
        message: String,
    },

    /// A required environment variable is missing.
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// An envelope did not match the expected shape for its verb.
    #[error("Malformed '{verb}' envelope: {message}")]
    Malformed {
        /// Verb of the malformed envelope.
        verb: String,
        /// What was wrong with it.
        message: String,
    },
}

impl IpcError {
    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout { .. })
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
