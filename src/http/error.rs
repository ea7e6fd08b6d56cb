//! Error types for the HTTP bridge.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the HTTP bridge.
#[derive(Debug, Error)]
pub enum HttpBridgeError {
    /// Could not bind the listen address.
    #[error("Failed to bind HTTP bridge on {addr}: {source}")]
    Bind {
        /// Address requested.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on an accepted connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}
