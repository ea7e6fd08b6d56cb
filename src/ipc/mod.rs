//! Envelope protocol between the host and connection processes.
//!
//! - [`protocol`]: envelope and verb types
//! - [`codec`]: length-prefixed JSON framing
//! - [`pending`]: outbound calls awaiting replies
//! - [`channel`]: reader/writer tasks, calls with timeouts
//! - [`listener`]: host-side socket accepting registrations
//! - [`client`]: connection-side dial and register

pub mod channel;
pub mod client;
pub mod codec;
pub mod error;
pub mod listener;
pub mod pending;
pub mod protocol;

pub use channel::IpcChannel;
pub use client::{ConnectionClient, ConnectionEnv};
pub use error::{IpcError, IpcResult};
pub use listener::{ChannelListener, ListenerConfig, RegistrationAttempt};
pub use protocol::{ConnectionToHost, Envelope, HostToConnection};
