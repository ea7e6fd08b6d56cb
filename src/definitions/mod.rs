//! Action, feedback, variable and preset catalogs published by connections.

pub mod registry;
pub mod types;

pub use registry::{CatalogDiff, DefinitionsEvent, DefinitionsRegistry};
pub use types::{
    ActionDefinition, FeedbackDefinition, FeedbackKind, OptionField, PresetDefinition,
    VariableDefinition, default_options,
};
