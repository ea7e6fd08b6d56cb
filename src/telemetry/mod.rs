//! Lifecycle audit trail for surface-host.
//!
//! Connection lifecycle events go to syslog with the `SURFACE_HOST` tag,
//! separate from the diagnostic `tracing` output on stderr.
//!
//! # Usage
//!
//! ```ignore
//! use surface_host::telemetry::{self, HostEvent};
//!
//! telemetry::init_logger()?;
//!
//! telemetry::audit().log(HostEvent::ConnectionStarted {
//!     connection_id: "osc-1".to_string(),
//!     pid: 4242,
//! });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"connection_started","connection_id":"osc-1","pid":4242}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::HostEvent;
pub use syslog::{AuditLogger, SYSLOG_TAG, audit, init_logger, init_null_logger, try_audit};
