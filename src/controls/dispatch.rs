//! Routing of action and feedback work to the owning connection.
//!
//! Controls never talk to connections directly. Every run, subscribe,
//! unsubscribe and learn goes through [`ConnectionDispatch`], which sends
//! internal instances to the [`InternalModule`] and everything else to the
//! handler of the owning connection. Disabled, unknown and unavailable
//! connections are skipped with a debug log.

use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::types::{ActionInstance, ControlId, FeedbackInstance};
use crate::connections::{ConnectionRegistry, INTERNAL_CONNECTION_ID};
use crate::host::{ConnectionHandler, ConnectionHost};
use crate::internal::InternalModule;

/// Learned option values, if the connection returned any.
pub type LearnFuture = Pin<Box<dyn Future<Output = Option<Map<String, Value>>> + Send>>;

/// Where controls send instance work.
pub trait ConnectionDispatch: Send + Sync {
    /// Run one action. Returns without waiting for the connection.
    fn run_action(&self, control_id: &ControlId, action: &ActionInstance, surface_id: Option<&str>);

    /// An action was added or its options changed.
    fn action_changed(&self, control_id: &ControlId, action: &ActionInstance);

    /// An action was removed.
    fn action_removed(&self, control_id: &ControlId, action: &ActionInstance);

    /// A feedback was added or changed.
    fn feedback_changed(&self, control_id: &ControlId, feedback: &FeedbackInstance);

    /// A feedback was removed.
    fn feedback_removed(&self, control_id: &ControlId, feedback: &FeedbackInstance);

    /// Ask the owning connection for an action's current option values.
    fn learn_action(&self, control_id: &ControlId, action: &ActionInstance) -> LearnFuture;

    /// Ask the owning connection for a feedback's current option values.
    fn learn_feedback(&self, control_id: &ControlId, feedback: &FeedbackInstance) -> LearnFuture;
}

/// Dispatch through the connection host.
pub struct HostDispatch {
    host: Weak<ConnectionHost>,
    internal: Arc<InternalModule>,
    registry: Arc<dyn ConnectionRegistry>,
}

impl HostDispatch {
    /// Create a dispatcher.
    pub fn new(
        host: Weak<ConnectionHost>,
        internal: Arc<InternalModule>,
        registry: Arc<dyn ConnectionRegistry>,
    ) -> Self {
        Self {
            host,
            internal,
            registry,
        }
    }

    fn handler_for(&self, connection_id: &str, what: &str) -> Option<Arc<ConnectionHandler>> {
        let Some(config) = self.registry.get(connection_id) else {
            debug!("Skipping {} for unknown connection {}", what, connection_id);
            return None;
        };
        if !config.enabled {
            debug!("Skipping {} for disabled connection {}", what, connection_id);
            return None;
        }
        let handler = self.host.upgrade()?.get_handler(connection_id);
        if handler.is_none() {
            debug!("Skipping {}: connection {} is unavailable", what, connection_id);
        }
        handler
    }
}

impl ConnectionDispatch for HostDispatch {
    fn run_action(&self, control_id: &ControlId, action: &ActionInstance, surface_id: Option<&str>) {
        if action.connection_id == INTERNAL_CONNECTION_ID {
            self.internal.execute_action(control_id, action, surface_id);
            return;
        }
        let Some(handler) = self.handler_for(&action.connection_id, "action") else {
            return;
        };
        let control_id = control_id.clone();
        let action = action.clone();
        let surface_id = surface_id.map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = handler.action_run(&control_id, &action, surface_id).await {
                warn!(
                    "Action '{}' on {} failed: {}",
                    action.action_type, action.connection_id, e
                );
            }
        });
    }

    fn action_changed(&self, control_id: &ControlId, action: &ActionInstance) {
        if action.connection_id == INTERNAL_CONNECTION_ID {
            return;
        }
        let Some(handler) = self.handler_for(&action.connection_id, "action update") else {
            return;
        };
        let control_id = control_id.clone();
        let action = action.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.action_update(&control_id, &action).await {
                warn!("updateActions to {} failed: {}", action.connection_id, e);
            }
        });
    }

    fn action_removed(&self, _control_id: &ControlId, action: &ActionInstance) {
        if action.connection_id == INTERNAL_CONNECTION_ID {
            return;
        }
        let Some(handler) = self.handler_for(&action.connection_id, "action delete") else {
            return;
        };
        let action = action.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.action_delete(&action).await {
                warn!("updateActions to {} failed: {}", action.connection_id, e);
            }
        });
    }

    fn feedback_changed(&self, control_id: &ControlId, feedback: &FeedbackInstance) {
        if feedback.connection_id == INTERNAL_CONNECTION_ID {
            self.internal.request_refresh();
            return;
        }
        let Some(handler) = self.handler_for(&feedback.connection_id, "feedback update") else {
            return;
        };
        let control_id = control_id.clone();
        let feedback = feedback.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.feedback_update(&control_id, &feedback).await {
                warn!("updateFeedbacks to {} failed: {}", feedback.connection_id, e);
            }
        });
    }

    fn feedback_removed(&self, _control_id: &ControlId, feedback: &FeedbackInstance) {
        if feedback.connection_id == INTERNAL_CONNECTION_ID {
            return;
        }
        let Some(handler) = self.handler_for(&feedback.connection_id, "feedback delete") else {
            return;
        };
        let feedback = feedback.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.feedback_delete(&feedback).await {
                warn!("updateFeedbacks to {} failed: {}", feedback.connection_id, e);
            }
        });
    }

    fn learn_action(&self, control_id: &ControlId, action: &ActionInstance) -> LearnFuture {
        let handler = if action.connection_id == INTERNAL_CONNECTION_ID {
            None
        } else {
            self.handler_for(&action.connection_id, "learn")
        };
        let control_id = control_id.clone();
        let action = action.clone();
        Box::pin(async move {
            let handler = handler?;
            match handler.action_learn_values(&control_id, &action).await {
                Ok(options) => options,
                Err(e) => {
                    warn!("learnAction on {} failed: {}", action.connection_id, e);
                    None
                }
            }
        })
    }

    fn learn_feedback(&self, control_id: &ControlId, feedback: &FeedbackInstance) -> LearnFuture {
        let handler = if feedback.connection_id == INTERNAL_CONNECTION_ID {
            None
        } else {
            self.handler_for(&feedback.connection_id, "learn")
        };
        let control_id = control_id.clone();
        let feedback = feedback.clone();
        Box::pin(async move {
            let handler = handler?;
            match handler.feedback_learn_values(&control_id, &feedback).await {
                Ok(options) => options,
                Err(e) => {
                    warn!("learnFeedback on {} failed: {}", feedback.connection_id, e);
                    None
                }
            }
        })
    }
}
