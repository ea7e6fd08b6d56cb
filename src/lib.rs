//! surface-host: control-surface automation host
//!
//! Runs every configured connection (a device or software integration) as a
//! supervised child process, talks to each over a framed JSON channel, and
//! executes the actions and feedbacks bound to controls on a button grid.
//!
//! # Fault Model
//!
//! Connections are untrusted and may crash, hang or misbehave. A connection
//! is never trusted until it registers with the token it was started with,
//! every call to it is bounded by a timeout, and a crashed process is
//! restarted without taking the host or other connections down.
//!
//! # Architecture
//!
//! - **IPC**: length-prefixed JSON envelopes over a Unix socket
//! - **Supervisor**: one child process per connection, with restart on crash
//! - **Host**: registration, per-connection lifecycle queue, protocol handler
//! - **Controls**: press/step state machine, delayed actions, draw style
//! - **Internal**: built-in actions and feedbacks (pages, timers, status)
//! - **HTTP**: optional bridge forwarding requests to connections
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: syslog audit trail of connection lifecycle events

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod connections;
pub mod controls;
pub mod definitions;
pub mod echo;
pub mod host;
pub mod http;
pub mod internal;
pub mod ipc;
pub mod orchestrator;
pub mod supervisor;
pub mod telemetry;
pub mod variables;
