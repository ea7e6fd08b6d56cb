//! Per-connection runtime record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::handler::ConnectionHandler;
use super::lifecycle::LifecycleQueue;
use crate::connections::ConnectionId;
use crate::supervisor::ProcessSupervisor;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No process.
    Stopped,
    /// Process being launched.
    Starting,
    /// Process running, no channel registered yet.
    AwaitingRegistration,
    /// Channel registered and `init` answered.
    Running,
    /// Being torn down.
    Stopping,
    /// Process exited unexpectedly and is being restarted.
    Crashed,
}

/// Mutable part of an entry.
pub(crate) struct EntryState {
    /// Lifecycle phase.
    pub phase: ConnectionPhase,
    /// Live process, if started.
    pub supervisor: Option<Arc<ProcessSupervisor>>,
    /// Handler of the registered channel.
    pub handler: Option<Arc<ConnectionHandler>>,
    /// Token a registering process must present. Cleared on stop.
    pub token: Option<String>,
    /// Bumped on every start and stop so stale process events are ignored.
    pub generation: u64,
    /// When the current process was started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the current channel registered.
    pub registered_at: Option<DateTime<Utc>>,
}

impl Default for EntryState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Stopped,
            supervisor: None,
            handler: None,
            token: None,
            generation: 0,
            started_at: None,
            registered_at: None,
        }
    }
}

/// Runtime record of one connection.
pub(crate) struct ConnectionEntry {
    /// Connection id.
    pub id: ConnectionId,
    /// Serialized start/stop work.
    pub queue: LifecycleQueue,
    /// Process, channel and handler.
    state: Mutex<EntryState>,
}

impl ConnectionEntry {
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        let id = id.into();
        Self {
            queue: LifecycleQueue::new(id.clone()),
            id,
            state: Mutex::new(EntryState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> ConnectionInfo {
        let state = self.state();
        ConnectionInfo {
            id: self.id.clone(),
            phase: state.phase,
            pid: state.supervisor.as_ref().and_then(|s| s.pid()),
            restarts: state
                .supervisor
                .as_ref()
                .map(|s| s.restart_count())
                .unwrap_or(0),
            started_at: state.started_at,
            registered_at: state.registered_at,
            has_handler: state.handler.is_some(),
            queued_jobs: self.queue.pending(),
        }
    }
}

/// Diagnostic view of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Lifecycle phase.
    pub phase: ConnectionPhase,
    /// Pid of the live process.
    pub pid: Option<u32>,
    /// Restarts of the current process.
    pub restarts: u32,
    /// When the current process was started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the current channel registered.
    pub registered_at: Option<DateTime<Utc>>,
    /// Whether a channel is registered.
    pub has_handler: bool,
    /// Lifecycle jobs not yet finished.
    pub queued_jobs: usize,
}
