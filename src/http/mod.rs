//! HTTP bridge.
//!
//! Requests under `/connections/{id}/` are forwarded to that connection as
//! `handleHttpRequest` calls.

pub mod bridge;
pub mod error;

pub use bridge::{HttpBridge, split_connection_path};
pub use error::HttpBridgeError;
