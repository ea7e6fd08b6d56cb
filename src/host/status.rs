//! Per-connection status and its good/warning/error tally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::connections::ConnectionId;
use crate::ipc::protocol::StatusLevel;

const EVENT_CAPACITY: usize = 256;

/// Coarse status used for colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCategory {
    /// Working.
    Good,
    /// Degraded.
    Warning,
    /// Not working.
    Error,
}

impl StatusLevel {
    /// Category of this level.
    pub fn category(self) -> StatusCategory {
        match self {
            StatusLevel::Ok => StatusCategory::Good,
            StatusLevel::BadConfig | StatusLevel::UnknownWarning => StatusCategory::Warning,
            StatusLevel::Connecting
            | StatusLevel::Disconnected
            | StatusLevel::ConnectionFailure
            | StatusLevel::UnknownError => StatusCategory::Error,
        }
    }
}

/// Last reported status of a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Reported level.
    pub level: StatusLevel,
    /// Category of the level.
    pub category: StatusCategory,
    /// Optional detail.
    pub message: Option<String>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Status change notification; `status` is `None` when forgotten.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// The connection.
    pub connection_id: ConnectionId,
    /// New status.
    pub status: Option<ConnectionStatus>,
}

/// Count of connections per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTally {
    /// Connections reporting good.
    pub good: usize,
    /// Connections reporting warning.
    pub warning: usize,
    /// Connections reporting error.
    pub error: usize,
}

/// Status of every connection.
pub struct StatusTracker {
    statuses: RwLock<HashMap<ConnectionId, ConnectionStatus>>,
    events: broadcast::Sender<StatusChange>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            statuses: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Record a status. Returns true when level or message changed.
    pub fn set(&self, connection_id: &str, level: StatusLevel, message: Option<String>) -> bool {
        let status = {
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = statuses.get(connection_id)
                && current.level == level
                && current.message == message
            {
                return false;
            }
            let status = ConnectionStatus {
                level,
                category: level.category(),
                message,
                updated_at: Utc::now(),
            };
            statuses.insert(connection_id.to_string(), status.clone());
            status
        };

        let _ = self.events.send(StatusChange {
            connection_id: connection_id.to_string(),
            status: Some(status),
        });
        true
    }

    /// Drop a connection's status.
    pub fn forget(&self, connection_id: &str) {
        let removed = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
        if removed.is_some() {
            let _ = self.events.send(StatusChange {
                connection_id: connection_id.to_string(),
                status: None,
            });
        }
    }

    /// Last status of a connection.
    pub fn get(&self, connection_id: &str) -> Option<ConnectionStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    /// Category of a connection's status.
    pub fn category(&self, connection_id: &str) -> Option<StatusCategory> {
        self.get(connection_id).map(|s| s.category)
    }

    /// Worst category among the given connections. Unknown ones are skipped.
    pub fn worst_of<'a>(&self, connection_ids: impl IntoIterator<Item = &'a str>) -> StatusCategory {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        connection_ids
            .into_iter()
            .filter_map(|id| statuses.get(id).map(|s| s.category))
            .max()
            .unwrap_or(StatusCategory::Good)
    }

    /// Worst category among every known connection.
    pub fn worst(&self) -> StatusCategory {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.category)
            .max()
            .unwrap_or(StatusCategory::Good)
    }

    /// Count connections per category.
    pub fn tally(&self) -> StatusTally {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        let mut tally = StatusTally::default();
        for status in statuses.values() {
            match status.category {
                StatusCategory::Good => tally.good += 1,
                StatusCategory::Warning => tally.warning += 1,
                StatusCategory::Error => tally.error += 1,
            }
        }
        tally
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(StatusLevel::Ok.category(), StatusCategory::Good);
        assert_eq!(StatusLevel::BadConfig.category(), StatusCategory::Warning);
        assert_eq!(StatusLevel::ConnectionFailure.category(), StatusCategory::Error);
        assert!(StatusCategory::Error > StatusCategory::Warning);
    }

    #[test]
    fn test_set_reports_changes_only() {
        let tracker = StatusTracker::new();
        assert!(tracker.set("a", StatusLevel::Connecting, None));
        assert!(!tracker.set("a", StatusLevel::Connecting, None));
        assert!(tracker.set("a", StatusLevel::Connecting, Some("retrying".to_string())));
        assert!(tracker.set("a", StatusLevel::Ok, None));
        assert_eq!(tracker.category("a"), Some(StatusCategory::Good));
    }

    #[test]
    fn test_worst_of_and_tally() {
        let tracker = StatusTracker::new();
        tracker.set("a", StatusLevel::Ok, None);
        tracker.set("b", StatusLevel::UnknownWarning, None);
        tracker.set("c", StatusLevel::UnknownError, None);

        assert_eq!(tracker.worst_of(["a"]), StatusCategory::Good);
        assert_eq!(tracker.worst_of(["a", "b"]), StatusCategory::Warning);
        assert_eq!(tracker.worst_of(["a", "b", "c", "missing"]), StatusCategory::Error);
        assert_eq!(tracker.worst_of(["missing"]), StatusCategory::Good);
        assert_eq!(tracker.worst(), StatusCategory::Error);
        assert_eq!(
            tracker.tally(),
            StatusTally {
                good: 1,
                warning: 1,
                error: 1
            }
        );
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let tracker = StatusTracker::new();
        let mut events = tracker.subscribe();
        tracker.set("a", StatusLevel::Ok, None);
        tracker.forget("a");

        let first = events.recv().await.unwrap();
        assert_eq!(first.status.unwrap().level, StatusLevel::Ok);
        let second = events.recv().await.unwrap();
        assert!(second.status.is_none());
        assert!(tracker.get("a").is_none());
    }
}
