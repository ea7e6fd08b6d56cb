//! Collaborators injected into the connection host.
//!
//! The host reaches controls, variables, action recording and OSC output
//! only through these traits, so each can be replaced in tests.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use super::status::StatusTracker;
use crate::connections::{ConnectionId, ConnectionRegistry, ModuleCatalog};
use crate::definitions::DefinitionsRegistry;
use crate::ipc::protocol::{
    ActionWire, FeedbackValueUpdate, FeedbackWire, RecordActionMessage, SendOscMessage,
    UpgradedItemsMessage,
};
use crate::variables::VariableStore;

/// Control-side operations the host needs.
pub trait ControlBridge: Send + Sync {
    /// Every action instance owned by a connection.
    fn actions_for_connection(&self, connection_id: &str) -> Vec<ActionWire>;

    /// Every feedback instance owned by a connection.
    fn feedbacks_for_connection(&self, connection_id: &str) -> Vec<FeedbackWire>;

    /// Merge feedback values pushed by a connection.
    ///
    /// Returns the number of controls whose cached values changed.
    fn update_feedback_values(&self, connection_id: &str, values: Vec<FeedbackValueUpdate>) -> usize;

    /// Replace options of instances rewritten by upgrade scripts.
    fn apply_upgraded_items(&self, connection_id: &str, items: UpgradedItemsMessage);

    /// Remove every instance owned by a connection, unsubscribing first.
    ///
    /// Returns the number of instances removed.
    fn prune_connection(&self, connection_id: &str) -> usize;
}

/// Receives actions recorded by connections.
pub trait ActionRecorder: Send + Sync {
    /// Record one action.
    fn record(&self, connection_id: &str, action: RecordActionMessage);
}

/// Sends OSC on behalf of connections.
pub trait OscSender: Send + Sync {
    /// Send one message.
    fn send(&self, connection_id: &str, message: SendOscMessage) -> Result<(), String>;
}

/// One action captured while recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAction {
    /// Connection that recorded it.
    pub connection_id: ConnectionId,
    /// The action.
    pub action: RecordActionMessage,
}

/// Recorder keeping actions in memory.
///
/// A recorded action with a `unique_id` replaces an earlier one with the
/// same id from the same connection.
#[derive(Debug, Default)]
pub struct MemoryActionRecorder {
    actions: Mutex<Vec<RecordedAction>>,
}

impl MemoryActionRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded actions in order.
    pub fn actions(&self) -> Vec<RecordedAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop every recorded action.
    pub fn clear(&self) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ActionRecorder for MemoryActionRecorder {
    fn record(&self, connection_id: &str, action: RecordActionMessage) {
        info!("Recorded action '{}' from {}", action.action_id, connection_id);
        let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(unique_id) = &action.unique_id
            && let Some(existing) = actions.iter_mut().find(|a| {
                a.connection_id == connection_id && a.action.unique_id.as_ref() == Some(unique_id)
            })
        {
            existing.action = action;
            return;
        }
        actions.push(RecordedAction {
            connection_id: connection_id.to_string(),
            action,
        });
    }
}

/// Everything the host and its handlers depend on.
#[derive(Clone)]
pub struct HostServices {
    /// Connection configuration.
    pub registry: Arc<dyn ConnectionRegistry>,
    /// Installed integration types.
    pub modules: Arc<dyn ModuleCatalog>,
    /// Published catalogs.
    pub definitions: Arc<DefinitionsRegistry>,
    /// Variable values.
    pub variables: Arc<dyn VariableStore>,
    /// Connection statuses.
    pub status: Arc<StatusTracker>,
    /// Recorded actions.
    pub recorder: Arc<dyn ActionRecorder>,
    /// OSC output.
    pub osc: Arc<dyn OscSender>,
}
