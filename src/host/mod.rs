//! Connection host.
//!
//! Owns one entry per connection: a serialized lifecycle queue, the
//! supervised process, and the protocol handler bound to the registered
//! channel.
//!
//! - [`manager`]: start, stop, restart, registration and handler lookup
//! - [`handler`]: verb translation for one registered channel
//! - [`lifecycle`]: per-connection serialized job queue
//! - [`status`]: connection status tracking
//! - [`services`]: injected collaborators
//! - [`osc`]: `send-osc` output

pub mod entry;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod manager;
pub mod osc;
pub mod services;
pub mod status;

pub use entry::{ConnectionInfo, ConnectionPhase};
pub use error::{HandlerError, HostError, RegisterError};
pub use handler::ConnectionHandler;
pub use manager::{ConnectionHost, HostConfig};
pub use services::{ActionRecorder, ControlBridge, HostServices, MemoryActionRecorder, OscSender};
pub use status::{StatusCategory, StatusTracker};
