//! Table of outbound calls awaiting a reply.
//!
//! Each call gets a fresh correlation id and a oneshot receiver. The reader
//! task resolves entries as replies arrive; the caller cancels its own entry
//! when its call window elapses. A reply for an id that is no longer present
//! (late, duplicate, or never issued) is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use super::protocol::CorrelationId;

/// Outcome delivered to a waiting caller.
pub type CallOutcome = Result<serde_json::Value, String>;

/// One call awaiting its reply.
struct PendingCall {
    /// Verb of the call, for diagnostics.
    verb: String,
    /// When the call was sent.
    sent_at: Instant,
    /// Channel delivering the reply.
    reply_tx: oneshot::Sender<CallOutcome>,
}

/// Information about an outstanding call.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    /// Correlation id.
    pub id: CorrelationId,
    /// Verb of the call.
    pub verb: String,
    /// Time spent waiting so far.
    pub waiting: Duration,
}

/// Outstanding calls keyed by correlation id.
pub struct PendingCalls {
    /// Next id to hand out. Ids start at 1 and never repeat.
    next_id: AtomicU64,
    /// Calls awaiting a reply.
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new call.
    ///
    /// Returns the correlation id to put on the envelope and the receiver
    /// that yields the reply.
    pub fn register(&self, verb: &str) -> (CorrelationId, oneshot::Receiver<CallOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingCall {
                    verb: verb.to_string(),
                    sent_at: Instant::now(),
                    reply_tx: tx,
                },
            );
        (id, rx)
    }

    /// Deliver a reply to its waiting caller.
    ///
    /// Returns false when no call with that id is outstanding.
    pub fn resolve(&self, id: CorrelationId, outcome: CallOutcome) -> bool {
        let call = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match call {
            Some(call) => {
                debug!(
                    "Reply for '{}' ({}) after {:?}",
                    call.verb,
                    id,
                    call.sent_at.elapsed()
                );
                // The caller may have given up already
                let _ = call.reply_tx.send(outcome);
                true
            }
            None => {
                debug!("Dropping reply for unknown correlation id {}", id);
                false
            }
        }
    }

    /// Forget a call without resolving it.
    pub fn cancel(&self, id: CorrelationId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Number of outstanding calls.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of outstanding calls.
    pub fn list_pending(&self) -> Vec<PendingInfo> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, call)| PendingInfo {
                id: *id,
                verb: call.verb.clone(),
                waiting: call.sent_at.elapsed(),
            })
            .collect()
    }
}
