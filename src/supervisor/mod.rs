//! Supervised connection processes.

pub mod error;
pub mod process;

pub use error::SupervisorError;
pub use process::{ProcessEvent, ProcessSpec, ProcessSupervisor};
