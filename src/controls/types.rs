//! Control data model and its persisted shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::connections::ConnectionId;
use crate::ipc::protocol::{ActionWire, FeedbackWire};

/// Stable id of a control.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlId(String);

impl ControlId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(format!("control:{}", Uuid::new_v4()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grid position of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Page number, starting at 1.
    pub page: u32,
    /// Row within the page.
    pub row: i32,
    /// Column within the page.
    pub column: i32,
}

/// Named slot holding an ordered list of actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionSetId {
    /// Fired on press.
    Down,
    /// Fired on release.
    Up,
    /// Fired on counter-clockwise rotation.
    RotateLeft,
    /// Fired on clockwise rotation.
    RotateRight,
    /// One step of a stepped control.
    Step(u32),
}

impl fmt::Display for ActionSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionSetId::Down => f.write_str("down"),
            ActionSetId::Up => f.write_str("up"),
            ActionSetId::RotateLeft => f.write_str("rotate_left"),
            ActionSetId::RotateRight => f.write_str("rotate_right"),
            ActionSetId::Step(step) => write!(f, "{}", step),
        }
    }
}

impl From<ActionSetId> for String {
    fn from(id: ActionSetId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ActionSetId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "down" => Ok(ActionSetId::Down),
            "up" => Ok(ActionSetId::Up),
            "rotate_left" => Ok(ActionSetId::RotateLeft),
            "rotate_right" => Ok(ActionSetId::RotateRight),
            other => other
                .parse::<u32>()
                .map(ActionSetId::Step)
                .map_err(|_| format!("invalid action set id '{}'", other)),
        }
    }
}

/// One configured action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInstance {
    /// Instance id.
    pub id: String,
    /// Owning connection.
    #[serde(rename = "instance")]
    pub connection_id: ConnectionId,
    /// Action type id.
    #[serde(rename = "action")]
    pub action_type: String,
    /// Option values.
    #[serde(default)]
    pub options: Map<String, Value>,
    /// User-entered delay in milliseconds.
    #[serde(default)]
    pub delay: u64,
}

impl ActionInstance {
    /// Create an instance with a fresh id.
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        action_type: impl Into<String>,
        options: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            action_type: action_type.into(),
            options,
            delay: 0,
        }
    }

    /// Form sent to the owning connection.
    pub fn to_wire(&self, control_id: &ControlId) -> ActionWire {
        ActionWire {
            id: self.id.clone(),
            control_id: control_id.to_string(),
            action_type: self.action_type.clone(),
            options: self.options.clone(),
        }
    }
}

/// One configured feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackInstance {
    /// Instance id.
    pub id: String,
    /// Owning connection.
    #[serde(rename = "instance_id")]
    pub connection_id: ConnectionId,
    /// Feedback type id.
    #[serde(rename = "type")]
    pub feedback_type: String,
    /// Option values.
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Style applied when a boolean feedback is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Map<String, Value>>,
    /// Invert a boolean value before applying it.
    #[serde(default, rename = "isInverted")]
    pub is_inverted: bool,
}

impl FeedbackInstance {
    /// Create an instance with a fresh id.
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        feedback_type: impl Into<String>,
        options: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            feedback_type: feedback_type.into(),
            options,
            style: None,
            is_inverted: false,
        }
    }

    /// Form sent to the owning connection.
    pub fn to_wire(&self, control_id: &ControlId) -> FeedbackWire {
        FeedbackWire {
            id: self.id.clone(),
            control_id: control_id.to_string(),
            feedback_type: self.feedback_type.clone(),
            options: self.options.clone(),
            is_inverted: self.is_inverted,
        }
    }
}

/// Kind of control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    /// Momentary button with down/up sets.
    #[serde(rename = "button")]
    Press,
    /// Button cycling through numbered steps.
    #[serde(rename = "step")]
    Step,
    /// Next page.
    #[serde(rename = "pageup")]
    PageUp,
    /// Page indicator; pressing returns to the first page.
    #[serde(rename = "pagenum")]
    PageNumber,
    /// Previous page.
    #[serde(rename = "pagedown")]
    PageDown,
}

impl ControlKind {
    /// Whether the control runs user actions.
    pub fn has_actions(self) -> bool {
        matches!(self, ControlKind::Press | ControlKind::Step)
    }
}

fn default_text_size() -> Value {
    Value::String("auto".to_string())
}

fn default_alignment() -> String {
    "center:center".to_string()
}

fn default_color() -> u32 {
    0xffffff
}

/// Base style of a control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonStyle {
    /// Text, may contain variable references.
    #[serde(default)]
    pub text: String,
    /// Text size, a number or `"auto"`.
    #[serde(default = "default_text_size")]
    pub size: Value,
    /// Text color as 0xRRGGBB.
    #[serde(default = "default_color")]
    pub color: u32,
    /// Background color as 0xRRGGBB.
    #[serde(default)]
    pub bgcolor: u32,
    /// Text alignment.
    #[serde(default = "default_alignment")]
    pub alignment: String,
    /// Image alignment.
    #[serde(default = "default_alignment")]
    pub pngalignment: String,
    /// Base64 PNG image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png64: Option<String>,
    /// Whether to draw the top bar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_topbar: Option<bool>,
}

impl Default for ButtonStyle {
    fn default() -> Self {
        Self {
            text: String::new(),
            size: default_text_size(),
            color: default_color(),
            bgcolor: 0,
            alignment: default_alignment(),
            pngalignment: default_alignment(),
            png64: None,
            show_topbar: None,
        }
    }
}

/// Behaviour switches of a control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlOptions {
    /// Delays accumulate down the action list.
    #[serde(default)]
    pub relative_delay: bool,
    /// Rotation fires the rotate sets.
    #[serde(default)]
    pub rotary_actions: bool,
    /// Stepped controls advance after each press.
    #[serde(default = "default_step_auto_progress")]
    pub step_auto_progress: bool,
}

fn default_step_auto_progress() -> bool {
    true
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            relative_delay: false,
            rotary_actions: false,
            step_auto_progress: true,
        }
    }
}

/// Style and options as persisted under `config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Base style.
    #[serde(flatten)]
    pub style: ButtonStyle,
    /// Behaviour switches.
    #[serde(flatten)]
    pub options: ControlOptions,
}

/// Persisted control: `{type, config, feedbacks, action_sets}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedControl {
    /// Control kind.
    #[serde(rename = "type")]
    pub kind: ControlKind,
    /// Style and options.
    #[serde(default)]
    pub config: ControlConfig,
    /// Feedbacks in evaluation order.
    #[serde(default)]
    pub feedbacks: Vec<FeedbackInstance>,
    /// Action sets by slot.
    #[serde(default)]
    pub action_sets: BTreeMap<ActionSetId, Vec<ActionInstance>>,
}
