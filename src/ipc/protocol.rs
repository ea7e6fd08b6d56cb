//! Envelope and verb types for host <-> connection communication.
//!
//! Every message on a connection channel is an [`Envelope`]. Calls carry a
//! correlation id and expect exactly one reply envelope with the same id;
//! fire-and-forget notices carry no id and are never answered.
//!
//! # Message Flow
//!
//! ```text
//! ┌─────────────────┐   HostToConnection   ┌─────────────────┐
//! │                 │─────────────────────>│                 │
//! │      Host       │                      │   Connection    │
//! │                 │<─────────────────────│    process      │
//! └─────────────────┘   ConnectionToHost   └─────────────────┘
//! ```
//!
//! Verbs are closed enums: the envelope's `verb` string is the serde tag of
//! the variant and `payload` is its content, so each verb has exactly one
//! static payload type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::error::{IpcError, IpcResult};
use crate::definitions::{
    ActionDefinition, FeedbackDefinition, PresetDefinition, VariableDefinition,
};

/// Correlation id matching a reply to its call.
pub type CorrelationId = u64;

/// Verb used by a freshly spawned process to claim its connection.
pub const REGISTER_VERB: &str = "register";

/// Whether an envelope starts an exchange or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A call (with correlation id) or a fire-and-forget notice (without).
    Call,
    /// A reply to an earlier call.
    Reply,
}

/// One framed IPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Call or reply.
    pub direction: Direction,
    /// Verb name.
    pub verb: String,
    /// Present for calls and replies, absent for notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Verb payload, or the success value of a reply.
    #[serde(default)]
    pub payload: Value,
    /// Error message of a failed reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Frame a call expecting a reply.
    pub fn call<M: Serialize>(id: CorrelationId, message: &M) -> IpcResult<Self> {
        let (verb, payload) = split_verb(message)?;
        Ok(Self {
            direction: Direction::Call,
            verb,
            correlation_id: Some(id),
            payload,
            error: None,
        })
    }

    /// Frame a fire-and-forget notice.
    pub fn notice<M: Serialize>(message: &M) -> IpcResult<Self> {
        let (verb, payload) = split_verb(message)?;
        Ok(Self {
            direction: Direction::Call,
            verb,
            correlation_id: None,
            payload,
            error: None,
        })
    }

    /// Frame the reply to a call.
    pub fn reply(id: CorrelationId, verb: impl Into<String>, result: Result<Value, String>) -> Self {
        let (payload, error) = match result {
            Ok(value) => (value, None),
            Err(message) => (Value::Null, Some(message)),
        };
        Self {
            direction: Direction::Reply,
            verb: verb.into(),
            correlation_id: Some(id),
            payload,
            error,
        }
    }

    /// Whether this envelope is a reply.
    pub fn is_reply(&self) -> bool {
        self.direction == Direction::Reply
    }

    /// Whether this envelope expects a reply.
    pub fn expects_reply(&self) -> bool {
        self.direction == Direction::Call && self.correlation_id.is_some()
    }

    /// Decode the verb and payload back into a typed message.
    pub fn decode<M: DeserializeOwned>(&self) -> IpcResult<M> {
        join_verb(&self.verb, self.payload.clone())
    }

    /// Result carried by a reply envelope.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(message) => Err(message),
            None => Ok(self.payload),
        }
    }
}

/// Split an adjacently tagged message into its verb and payload.
fn split_verb<M: Serialize>(message: &M) -> IpcResult<(String, Value)> {
    let value = serde_json::to_value(message)?;
    let Value::Object(mut object) = value else {
        return Err(IpcError::Malformed {
            verb: "<unknown>".to_string(),
            message: "message did not serialize to an object".to_string(),
        });
    };
    let verb = match object.remove("verb") {
        Some(Value::String(verb)) => verb,
        _ => {
            return Err(IpcError::Malformed {
                verb: "<unknown>".to_string(),
                message: "message has no verb tag".to_string(),
            });
        }
    };
    let payload = object.remove("payload").unwrap_or(Value::Null);
    Ok((verb, payload))
}

/// Rebuild a typed message from a verb and payload.
fn join_verb<M: DeserializeOwned>(verb: &str, payload: Value) -> IpcResult<M> {
    let mut object = Map::new();
    object.insert("verb".to_string(), Value::String(verb.to_string()));
    if !payload.is_null() {
        object.insert("payload".to_string(), payload);
    }
    serde_json::from_value(Value::Object(object)).map_err(|e| IpcError::Malformed {
        verb: verb.to_string(),
        message: e.to_string(),
    })
}

/// Log level of a `log-message` notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug-level message.
    Debug,
    /// Informational message.
    Info,
    /// Warning message.
    Warn,
    /// Error message.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Connection status as reported through `set-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    /// Working normally.
    Ok,
    /// Establishing its link to the device.
    Connecting,
    /// Lost its link to the device.
    Disconnected,
    /// Failed to reach the device.
    ConnectionFailure,
    /// Configuration is invalid.
    BadConfig,
    /// Unclassified error.
    UnknownError,
    /// Unclassified warning.
    UnknownWarning,
}

/// An action instance as seen by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionWire {
    /// Instance id.
    pub id: String,
    /// Control the instance lives on.
    pub control_id: String,
    /// Action type id within the connection's catalog.
    #[serde(rename = "actionId")]
    pub action_type: String,
    /// Option values.
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// A feedback instance as seen by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackWire {
    /// Instance id.
    pub id: String,
    /// Control the instance lives on.
    pub control_id: String,
    /// Feedback type id within the connection's catalog.
    #[serde(rename = "feedbackId")]
    pub feedback_type: String,
    /// Option values.
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Whether a boolean result is inverted host-side.
    #[serde(default)]
    pub is_inverted: bool,
}

/// Payload of the `register` handshake call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Semver of the protocol the process speaks.
    pub api_version: String,
    /// Connection the process claims to serve.
    pub connection_id: String,
    /// Token handed to the process in its environment.
    pub token: String,
}

/// Payload of `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Connection label.
    pub label: String,
    /// Full connection configuration.
    pub config: Value,
    /// Last upgrade script index applied to this connection's data.
    pub last_upgrade_index: Option<i64>,
    /// Every known action instance owned by the connection.
    pub actions: HashMap<String, ActionWire>,
    /// Every known feedback instance owned by the connection.
    pub feedbacks: HashMap<String, FeedbackWire>,
}

/// Reply to `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitResponse {
    /// Connection answers `handleHttpRequest`.
    pub has_http_handler: bool,
    /// Connection answers `startStopRecordActions`.
    pub has_record_actions_handler: bool,
    /// Upgrade index after running upgrade scripts.
    pub new_upgrade_index: Option<i64>,
    /// Configuration rewritten by upgrade scripts.
    pub updated_config: Option<Value>,
}

/// Payload of `updateConfigAndLabel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAndLabel {
    /// New label.
    pub label: String,
    /// New configuration.
    pub config: Value,
}

/// Payload of `updateActions`; `None` marks a deleted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateActionsRequest {
    /// Changed or deleted instances by id.
    pub actions: HashMap<String, Option<ActionWire>>,
}

/// Payload of `updateFeedbacks`; `None` marks a deleted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFeedbacksRequest {
    /// Changed or deleted instances by id.
    pub feedbacks: HashMap<String, Option<FeedbackWire>>,
}

/// Payload of `executeAction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteActionRequest {
    /// The action to run.
    pub action: ActionWire,
    /// Surface that triggered the press, if any.
    pub surface_id: Option<String>,
}

/// Payload of `learnAction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnActionRequest {
    /// Action whose options should be learned.
    pub action: ActionWire,
}

/// Payload of `learnFeedback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnFeedbackRequest {
    /// Feedback whose options should be learned.
    pub feedback: FeedbackWire,
}

/// Reply to `learnAction` / `learnFeedback`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LearnResponse {
    /// Learned option values, or `None` when nothing could be learned.
    pub options: Option<Map<String, Value>>,
}

/// Payload of `startStopRecordActions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordActionsRequest {
    /// Whether recording is active.
    pub recording: bool,
}

/// Payload of `handleHttpRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestWire {
    /// Base URL the connection is mounted under.
    pub base_url: String,
    /// Request path relative to the base URL.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Query parameters.
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body as text.
    #[serde(default)]
    pub body: Option<String>,
}

/// Reply to `handleHttpRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseWire {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response body as text.
    #[serde(default)]
    pub body: Option<String>,
}

/// Payload of the fire-and-forget `variablesChanged` notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesChangedNotice {
    /// Fully qualified names (`label:name`) of changed variables.
    pub variables: Vec<String>,
}

/// Messages sent from the host to a connection process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", content = "payload", rename_all = "camelCase")]
pub enum HostToConnection {
    /// First call after registration.
    Init(InitRequest),
    /// Configuration or label changed.
    UpdateConfigAndLabel(ConfigAndLabel),
    /// Ask for the configuration field definitions.
    GetConfigFields,
    /// Action instances changed or were removed.
    UpdateActions(UpdateActionsRequest),
    /// Feedback instances changed or were removed.
    UpdateFeedbacks(UpdateFeedbacksRequest),
    /// Run one action.
    ExecuteAction(ExecuteActionRequest),
    /// Learn an action's options from the device.
    LearnAction(LearnActionRequest),
    /// Learn a feedback's options from the device.
    LearnFeedback(LearnFeedbackRequest),
    /// Connection is about to be stopped.
    Destroy,
    /// Action recording toggled.
    StartStopRecordActions(RecordActionsRequest),
    /// Forwarded HTTP request.
    HandleHttpRequest(HttpRequestWire),
    /// Variables changed (fire-and-forget).
    VariablesChanged(VariablesChangedNotice),
}

/// Payload of `log-message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

/// Payload of `set-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStatusMessage {
    /// New status.
    pub status: StatusLevel,
    /// Optional detail.
    #[serde(default)]
    pub message: Option<String>,
}

/// One variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValue {
    /// Variable name within the connection.
    pub name: String,
    /// New value; `null` clears it.
    pub value: Value,
}

/// One feedback value pushed by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValueUpdate {
    /// Feedback instance id.
    pub id: String,
    /// Control the feedback lives on.
    pub control_id: String,
    /// Boolean or partial style object.
    pub value: Value,
}

/// Payload of `send-osc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOscMessage {
    /// Target host.
    pub host: String,
    /// Target UDP port.
    pub port: u16,
    /// OSC address.
    pub path: String,
    /// OSC arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Payload of `parseVariablesInString`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseVariablesRequest {
    /// Text containing `$(label:name)` references.
    pub text: String,
    /// Control the text belongs to, if any.
    #[serde(default)]
    pub control_id: Option<String>,
}

/// Reply to `parseVariablesInString`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseVariablesResponse {
    /// Text with references substituted.
    pub text: String,
    /// Variables referenced by the text.
    pub variable_ids: Vec<String>,
}

/// Payload of `upgradedItems`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradedItemsMessage {
    /// Actions rewritten by upgrade scripts.
    pub actions: Vec<ActionWire>,
    /// Feedbacks rewritten by upgrade scripts.
    pub feedbacks: Vec<FeedbackWire>,
}

/// Payload of `recordAction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordActionMessage {
    /// Action type id.
    pub action_id: String,
    /// Option values.
    #[serde(default)]
    pub options: Map<String, Value>,
    /// De-duplication key.
    #[serde(default)]
    pub unique_id: Option<String>,
    /// Delay to record with the action.
    #[serde(default)]
    pub delay: Option<u64>,
}

/// Payload of `setCustomVariable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCustomVariableMessage {
    /// Custom variable name.
    pub name: String,
    /// New value.
    pub value: Value,
}

/// Payload of `saveConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveConfigMessage {
    /// Configuration to persist.
    pub config: Value,
}

/// Messages sent from a connection process to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", content = "payload", rename_all = "camelCase")]
pub enum ConnectionToHost {
    /// Registration handshake.
    Register(RegisterRequest),
    /// Log line.
    #[serde(rename = "log-message")]
    LogMessage(LogMessage),
    /// Status change.
    #[serde(rename = "set-status")]
    SetStatus(SetStatusMessage),
    /// Replace the action catalog.
    SetActionDefinitions {
        /// New catalog.
        actions: Vec<ActionDefinition>,
    },
    /// Replace the feedback catalog.
    SetFeedbackDefinitions {
        /// New catalog.
        feedbacks: Vec<FeedbackDefinition>,
    },
    /// Replace the variable catalog.
    SetVariableDefinitions {
        /// New catalog.
        variables: Vec<VariableDefinition>,
    },
    /// Replace the preset catalog.
    SetPresetDefinitions {
        /// New catalog.
        presets: Vec<PresetDefinition>,
    },
    /// Merge variable values.
    SetVariableValues {
        /// Changed values.
        values: Vec<VariableValue>,
    },
    /// Merge feedback values into control caches.
    UpdateFeedbackValues {
        /// Changed values.
        values: Vec<FeedbackValueUpdate>,
    },
    /// Persist configuration.
    SaveConfig(SaveConfigMessage),
    /// Send an OSC message on the connection's behalf.
    #[serde(rename = "send-osc")]
    SendOsc(SendOscMessage),
    /// Substitute variables in a string.
    ParseVariablesInString(ParseVariablesRequest),
    /// Instances rewritten by upgrade scripts.
    UpgradedItems(UpgradedItemsMessage),
    /// Record an action while recording is active.
    RecordAction(RecordActionMessage),
    /// Set a custom variable.
    SetCustomVariable(SetCustomVariableMessage),
}
