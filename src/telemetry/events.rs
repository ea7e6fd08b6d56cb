//! Audit event types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle events recorded in the audit trail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// Host started.
    HostStart {
        /// Process id of the host.
        pid: u32,
        /// Configured connections.
        connections: usize,
    },

    /// Host stopped.
    HostStop {
        /// Run time in seconds.
        duration_sec: u64,
    },

    /// A connection process was spawned.
    ConnectionStarted {
        /// Connection id.
        connection_id: String,
        /// OS process id.
        pid: u32,
    },

    /// A connection process exited.
    ConnectionExited {
        /// Connection id.
        connection_id: String,
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// False when the process crashed.
        expected: bool,
    },

    /// A channel registered successfully.
    ConnectionRegistered {
        /// Connection id.
        connection_id: String,
        /// API version claimed by the process.
        api_version: String,
    },

    /// A registration was refused and its channel closed.
    RegistrationRejected {
        /// Connection id claimed by the process.
        connection_id: String,
        /// Why it was refused.
        reason: String,
    },

    /// A connection was stopped on request.
    ConnectionStopped {
        /// Connection id.
        connection_id: String,
    },
}

/// Event with its timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// RFC3339 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The event, flattened.
    #[serde(flatten)]
    pub event: &'a HostEvent,
}

impl HostEvent {
    /// Wrap this event with the current time.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_started_serialization() {
        let event = HostEvent::ConnectionStarted {
            connection_id: "osc-1".to_string(),
            pid: 4242,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"connection_started\""));
        assert!(json.contains("\"connection_id\":\"osc-1\""));
        assert!(json.contains("\"pid\":4242"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_connection_exited_serialization() {
        let event = HostEvent::ConnectionExited {
            connection_id: "osc-1".to_string(),
            code: None,
            expected: false,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"connection_exited\""));
        assert!(json.contains("\"code\":null"));
        assert!(json.contains("\"expected\":false"));
    }

    #[test]
    fn test_registration_rejected_serialization() {
        let event = HostEvent::RegistrationRejected {
            connection_id: "osc-1".to_string(),
            reason: "Token mismatch for connection 'osc-1'".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"registration_rejected\""));
        assert!(json.contains("Token mismatch"));
    }

    #[test]
    fn test_host_stop_serialization() {
        let json = serde_json::to_string(&HostEvent::HostStop { duration_sec: 61 }.with_timestamp())
            .unwrap();

        assert!(json.contains("\"event\":\"host_stop\""));
        assert!(json.contains("\"duration_sec\":61"));
    }
}
