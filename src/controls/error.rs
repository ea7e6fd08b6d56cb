//! Error types for the control runtime.

use thiserror::Error;

use super::types::{ActionSetId, ControlId, ControlKind};

/// Errors from control mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// No control with this id.
    #[error("Unknown control '{0}'")]
    UnknownControl(ControlId),

    /// The control kind does not run actions.
    #[error("Control kind {0:?} has no actions")]
    NoActions(ControlKind),

    /// The control has no such action set.
    #[error("Unknown action set '{0}'")]
    UnknownActionSet(ActionSetId),

    /// The action set is not valid for this control kind.
    #[error("Action set '{set}' is not valid for {kind:?} controls")]
    InvalidActionSet {
        /// The set.
        set: ActionSetId,
        /// The control kind.
        kind: ControlKind,
    },

    /// No action with this id in the set.
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    /// No feedback with this id.
    #[error("Unknown feedback '{0}'")]
    UnknownFeedback(String),

    /// Per-instance style only applies to boolean feedbacks.
    #[error("Feedback '{0}' is not a boolean feedback")]
    NotBoolean(String),

    /// A stepped control must keep at least one step.
    #[error("Cannot remove the last step")]
    LastStep,
}
