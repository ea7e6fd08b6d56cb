//! Redraw notifications for the graphics collaborator.

use tokio::sync::broadcast;

use super::types::ControlId;

const REDRAW_CAPACITY: usize = 1024;

/// Receives "redraw needed" signals.
pub trait RedrawSink: Send + Sync {
    /// A control's draw style may have changed.
    fn redraw(&self, control_id: &ControlId);
}

/// Redraw sink publishing control ids on a broadcast channel.
pub struct BroadcastRedraw {
    tx: broadcast::Sender<ControlId>,
}

impl Default for BroadcastRedraw {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRedraw {
    /// Create a sink with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REDRAW_CAPACITY);
        Self { tx }
    }

    /// Subscribe to redraw signals.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlId> {
        self.tx.subscribe()
    }
}

impl RedrawSink for BroadcastRedraw {
    fn redraw(&self, control_id: &ControlId) {
        let _ = self.tx.send(control_id.clone());
    }
}
