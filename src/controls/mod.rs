//! Control execution runtime.
//!
//! - [`types`]: control data model and persisted shape
//! - [`control`]: press/step state machine and draw style
//! - [`runner`]: delayed-action timers and busy tracking
//! - [`dispatch`]: routing instance work to connections
//! - [`store`]: every control, and the bridge the host talks to
//! - [`redraw`]: redraw signals

pub mod control;
pub mod dispatch;
pub mod error;
pub mod redraw;
pub mod runner;
pub mod store;
pub mod types;

pub use control::{Control, ControlContext, DrawStyle, StepIndicator};
pub use dispatch::{ConnectionDispatch, HostDispatch, LearnFuture};
pub use error::ControlError;
pub use redraw::{BroadcastRedraw, RedrawSink};
pub use runner::{ActionRunner, BusyChange};
pub use store::{ControlServices, ControlStore};
pub use types::{
    ActionInstance, ActionSetId, ButtonStyle, ControlConfig, ControlId, ControlKind,
    ControlOptions, FeedbackInstance, Location, PersistedControl,
};
