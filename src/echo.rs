//! Reference connection process.
//!
//! Spawned by the host as a hidden subcommand:
//!
//! ```ignore
//! surface-host internal-echo
//! ```
//!
//! The process:
//! 1. Reads its identity from `CONNECTION_ID`, `CHANNEL_ADDRESS` and
//!    `CHANNEL_TOKEN`
//! 2. Dials the host and registers
//! 3. Publishes a small catalog on `init`: `log`, `toggle` and `set_status`
//!    actions, a boolean `toggled` feedback and `state`/`presses` variables
//! 4. Answers every host call until `destroy` or hangup
//!
//! Message handling lives in [`EchoConnection`], which turns one host
//! message into a reply value plus notices to send first. The socket loop in
//! [`run`] only moves envelopes.

use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::definitions::{
    ActionDefinition, FeedbackDefinition, FeedbackKind, OptionField, VariableDefinition,
};
use crate::ipc::protocol::{
    ActionWire, FeedbackValueUpdate, HttpRequestWire, HttpResponseWire, InitResponse, LearnResponse,
    LogLevel, LogMessage, SetStatusMessage, StatusLevel, VariableValue,
};
use crate::ipc::{ConnectionClient, ConnectionEnv, ConnectionToHost, HostToConnection, IpcResult};

/// Protocol version the echo process registers with.
pub const ECHO_API_VERSION: &str = "1.0.0";

/// Reply window for calls to the host.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Feedback type reporting the toggle state.
const TOGGLED_FEEDBACK: &str = "toggled";

/// Connection-side state of the echo process.
#[derive(Debug, Default)]
pub struct EchoConnection {
    label: String,
    toggled: bool,
    presses: u64,
    /// Subscribed `toggled` feedbacks: instance id to control id.
    subscriptions: BTreeMap<String, String>,
}

/// What to do with one host message.
#[derive(Debug, Default)]
pub struct EchoOutcome {
    /// Notices to send before replying.
    pub notices: Vec<ConnectionToHost>,
    /// Reply payload, used when the message was a call.
    pub reply: Value,
    /// Whether the process should exit after replying.
    pub exit: bool,
}

impl EchoConnection {
    /// Create an uninitialized connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current toggle state.
    pub fn is_toggled(&self) -> bool {
        self.toggled
    }

    /// Handle one host message.
    pub fn handle(&mut self, message: HostToConnection) -> EchoOutcome {
        match message {
            HostToConnection::Init(request) => {
                self.label = request.label;
                self.subscriptions = request
                    .feedbacks
                    .into_values()
                    .filter(|f| f.feedback_type == TOGGLED_FEEDBACK)
                    .map(|f| (f.id, f.control_id))
                    .collect();
                info!("Echo connection '{}' initialized", self.label);

                let mut notices = vec![
                    ConnectionToHost::SetActionDefinitions {
                        actions: action_definitions(),
                    },
                    ConnectionToHost::SetFeedbackDefinitions {
                        feedbacks: feedback_definitions(),
                    },
                    ConnectionToHost::SetVariableDefinitions {
                        variables: variable_definitions(),
                    },
                    self.variable_values(),
                    ConnectionToHost::SetStatus(SetStatusMessage {
                        status: StatusLevel::Ok,
                        message: None,
                    }),
                ];
                notices.extend(self.feedback_values(self.subscriptions.keys()));

                EchoOutcome {
                    notices,
                    reply: to_value(&InitResponse {
                        has_http_handler: true,
                        ..InitResponse::default()
                    }),
                    exit: false,
                }
            }
            HostToConnection::UpdateConfigAndLabel(update) => {
                self.label = update.label;
                EchoOutcome::default()
            }
            HostToConnection::GetConfigFields => EchoOutcome {
                reply: json!([]),
                ..EchoOutcome::default()
            },
            HostToConnection::UpdateActions(_) => EchoOutcome::default(),
            HostToConnection::UpdateFeedbacks(request) => {
                let mut added = Vec::new();
                for (id, feedback) in request.feedbacks {
                    match feedback {
                        Some(f) if f.feedback_type == TOGGLED_FEEDBACK => {
                            self.subscriptions.insert(id.clone(), f.control_id);
                            added.push(id);
                        }
                        _ => {
                            self.subscriptions.remove(&id);
                        }
                    }
                }
                EchoOutcome {
                    notices: self.feedback_values(added.iter()).into_iter().collect(),
                    ..EchoOutcome::default()
                }
            }
            HostToConnection::ExecuteAction(request) => EchoOutcome {
                notices: self.execute(&request.action),
                ..EchoOutcome::default()
            },
            HostToConnection::LearnAction(request) => EchoOutcome {
                reply: to_value(&LearnResponse {
                    options: Some(request.action.options),
                }),
                ..EchoOutcome::default()
            },
            HostToConnection::LearnFeedback(request) => EchoOutcome {
                reply: to_value(&LearnResponse {
                    options: Some(request.feedback.options),
                }),
                ..EchoOutcome::default()
            },
            HostToConnection::Destroy => {
                info!("Echo connection '{}' destroyed", self.label);
                EchoOutcome {
                    exit: true,
                    ..EchoOutcome::default()
                }
            }
            HostToConnection::StartStopRecordActions(_) => EchoOutcome::default(),
            HostToConnection::HandleHttpRequest(request) => EchoOutcome {
                reply: to_value(&self.http_response(&request)),
                ..EchoOutcome::default()
            },
            HostToConnection::VariablesChanged(notice) => {
                debug!("Variables changed: {:?}", notice);
                EchoOutcome::default()
            }
        }
    }

    fn execute(&mut self, action: &ActionWire) -> Vec<ConnectionToHost> {
        self.presses += 1;
        match action.action_type.as_str() {
            "log" => {
                let message = action
                    .options
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("pressed");
                vec![
                    ConnectionToHost::LogMessage(LogMessage {
                        level: LogLevel::Info,
                        message: format!("{} (control {})", message, action.control_id),
                    }),
                    self.variable_values(),
                ]
            }
            "toggle" => {
                self.toggled = !self.toggled;
                let mut notices = vec![self.variable_values()];
                let ids: Vec<String> = self.subscriptions.keys().cloned().collect();
                notices.extend(self.feedback_values(ids.iter()));
                notices
            }
            "set_status" => {
                let status = action
                    .options
                    .get("status")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<StatusLevel>(v).ok());
                let Some(status) = status else {
                    warn!("set_status without a valid status option");
                    return vec![self.variable_values()];
                };
                let message = action
                    .options
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                vec![
                    ConnectionToHost::SetStatus(SetStatusMessage { status, message }),
                    self.variable_values(),
                ]
            }
            other => {
                warn!("Unknown action type '{}'", other);
                Vec::new()
            }
        }
    }

    fn variable_values(&self) -> ConnectionToHost {
        ConnectionToHost::SetVariableValues {
            values: vec![
                VariableValue {
                    name: "state".to_string(),
                    value: json!(if self.toggled { "on" } else { "off" }),
                },
                VariableValue {
                    name: "presses".to_string(),
                    value: json!(self.presses),
                },
            ],
        }
    }

    /// Current `toggled` value for the given subscriptions, if any.
    fn feedback_values<'a>(
        &self,
        ids: impl Iterator<Item = &'a String>,
    ) -> Option<ConnectionToHost> {
        let values: Vec<FeedbackValueUpdate> = ids
            .filter_map(|id| {
                self.subscriptions.get(id).map(|control_id| FeedbackValueUpdate {
                    id: id.clone(),
                    control_id: control_id.clone(),
                    value: Value::Bool(self.toggled),
                })
            })
            .collect();
        (!values.is_empty()).then_some(ConnectionToHost::UpdateFeedbackValues { values })
    }

    fn http_response(&self, request: &HttpRequestWire) -> HttpResponseWire {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let body = json!({
            "label": self.label,
            "method": request.method,
            "path": request.path,
            "query": request.query,
            "toggled": self.toggled,
        });
        HttpResponseWire {
            status: 200,
            headers,
            body: Some(body.to_string()),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn option(id: &str, label: &str, field_type: &str, default: Value) -> OptionField {
    OptionField {
        id: id.to_string(),
        label: label.to_string(),
        field_type: field_type.to_string(),
        default: Some(default),
    }
}

fn action_definitions() -> Vec<ActionDefinition> {
    vec![
        ActionDefinition {
            id: "log".to_string(),
            name: "Log a message".to_string(),
            description: None,
            options: vec![option("message", "Message", "textinput", json!("pressed"))],
            has_learn: false,
        },
        ActionDefinition {
            id: "toggle".to_string(),
            name: "Toggle state".to_string(),
            description: None,
            options: Vec::new(),
            has_learn: false,
        },
        ActionDefinition {
            id: "set_status".to_string(),
            name: "Report a status".to_string(),
            description: Some("Report a connection status to the host".to_string()),
            options: vec![
                option("status", "Status", "dropdown", json!("ok")),
                option("message", "Message", "textinput", Value::Null),
            ],
            has_learn: true,
        },
    ]
}

fn feedback_definitions() -> Vec<FeedbackDefinition> {
    let mut style = Map::new();
    style.insert("color".to_string(), json!(0xffffff));
    style.insert("bgcolor".to_string(), json!(0x0000c8));
    vec![FeedbackDefinition {
        id: TOGGLED_FEEDBACK.to_string(),
        name: "Toggled".to_string(),
        kind: FeedbackKind::Boolean,
        description: None,
        default_style: Some(style),
        options: Vec::new(),
        has_learn: false,
        show_invert: true,
    }]
}

fn variable_definitions() -> Vec<VariableDefinition> {
    vec![
        VariableDefinition {
            name: "state".to_string(),
            label: "Toggle state".to_string(),
        },
        VariableDefinition {
            name: "presses".to_string(),
            label: "Actions executed".to_string(),
        },
    ]
}

/// Register with the host and serve until `destroy` or hangup.
///
/// # Errors
///
/// Returns an error when the environment is incomplete, the host cannot be
/// reached, or the registration is refused.
pub async fn run() -> IpcResult<()> {
    let env = ConnectionEnv::from_env()?;
    let mut client = ConnectionClient::connect(&env, ECHO_API_VERSION, CALL_TIMEOUT).await?;
    let mut connection = EchoConnection::new();

    while let Some(envelope) = client.next().await {
        let reply_id = envelope.correlation_id.filter(|_| envelope.expects_reply());
        let message = match envelope.decode::<HostToConnection>() {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable '{}' from host: {}", envelope.verb, e);
                if let Some(id) = reply_id {
                    client.reply(id, &envelope.verb, Err(e.to_string())).await?;
                }
                continue;
            }
        };

        let outcome = connection.handle(message);
        for notice in &outcome.notices {
            client.send(notice).await?;
        }
        if let Some(id) = reply_id {
            client.reply(id, &envelope.verb, Ok(outcome.reply)).await?;
        }
        if outcome.exit {
            break;
        }
    }

    debug!("Echo connection {} exiting", client.connection_id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{
        ExecuteActionRequest, FeedbackWire, InitRequest, UpdateFeedbacksRequest,
    };

    fn init(feedbacks: HashMap<String, FeedbackWire>) -> HostToConnection {
        HostToConnection::Init(InitRequest {
            label: "echo".to_string(),
            config: json!({}),
            last_upgrade_index: None,
            actions: HashMap::new(),
            feedbacks,
        })
    }

    fn toggled_feedback(id: &str, control_id: &str) -> FeedbackWire {
        FeedbackWire {
            id: id.to_string(),
            control_id: control_id.to_string(),
            feedback_type: TOGGLED_FEEDBACK.to_string(),
            options: Map::new(),
            is_inverted: false,
        }
    }

    fn execute(action_type: &str, options: Map<String, Value>) -> HostToConnection {
        HostToConnection::ExecuteAction(ExecuteActionRequest {
            action: ActionWire {
                id: "a1".to_string(),
                control_id: "c1".to_string(),
                action_type: action_type.to_string(),
                options,
            },
            surface_id: None,
        })
    }

    #[test]
    fn test_init_publishes_catalog_and_status() {
        let mut connection = EchoConnection::new();
        let outcome = connection.handle(init(HashMap::new()));

        let response: InitResponse = serde_json::from_value(outcome.reply).unwrap();
        assert!(response.has_http_handler);
        assert!(!response.has_record_actions_handler);

        assert!(matches!(
            outcome.notices[0],
            ConnectionToHost::SetActionDefinitions { ref actions } if actions.len() == 3
        ));
        assert!(outcome.notices.iter().any(|n| matches!(
            n,
            ConnectionToHost::SetStatus(SetStatusMessage { status: StatusLevel::Ok, .. })
        )));
        assert!(!outcome.exit);
    }

    #[test]
    fn test_init_pushes_known_feedbacks() {
        let mut connection = EchoConnection::new();
        let mut feedbacks = HashMap::new();
        feedbacks.insert("f1".to_string(), toggled_feedback("f1", "c1"));
        let outcome = connection.handle(init(feedbacks));

        let pushed = outcome.notices.iter().find_map(|n| match n {
            ConnectionToHost::UpdateFeedbackValues { values } => Some(values.clone()),
            _ => None,
        });
        let pushed = pushed.unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].control_id, "c1");
        assert_eq!(pushed[0].value, json!(false));
    }

    #[test]
    fn test_toggle_pushes_feedback_values() {
        let mut connection = EchoConnection::new();
        connection.handle(init(HashMap::new()));

        let mut feedbacks = HashMap::new();
        feedbacks.insert("f1".to_string(), Some(toggled_feedback("f1", "c1")));
        connection.handle(HostToConnection::UpdateFeedbacks(UpdateFeedbacksRequest {
            feedbacks,
        }));

        let outcome = connection.handle(execute("toggle", Map::new()));
        assert!(connection.is_toggled());
        let values = outcome
            .notices
            .iter()
            .find_map(|n| match n {
                ConnectionToHost::UpdateFeedbackValues { values } => Some(values.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(values[0].id, "f1");
        assert_eq!(values[0].value, json!(true));
    }

    #[test]
    fn test_removed_feedback_stops_updates() {
        let mut connection = EchoConnection::new();
        let mut feedbacks = HashMap::new();
        feedbacks.insert("f1".to_string(), toggled_feedback("f1", "c1"));
        connection.handle(init(feedbacks));

        let mut removed = HashMap::new();
        removed.insert("f1".to_string(), None);
        connection.handle(HostToConnection::UpdateFeedbacks(UpdateFeedbacksRequest {
            feedbacks: removed,
        }));

        let outcome = connection.handle(execute("toggle", Map::new()));
        assert!(
            !outcome
                .notices
                .iter()
                .any(|n| matches!(n, ConnectionToHost::UpdateFeedbackValues { .. }))
        );
    }

    #[test]
    fn test_log_action_sends_log_message() {
        let mut connection = EchoConnection::new();
        let mut options = Map::new();
        options.insert("message".to_string(), json!("hello"));
        let outcome = connection.handle(execute("log", options));

        match &outcome.notices[0] {
            ConnectionToHost::LogMessage(log) => {
                assert_eq!(log.level, LogLevel::Info);
                assert_eq!(log.message, "hello (control c1)");
            }
            other => unreachable!("Expected LogMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_set_status_action() {
        let mut connection = EchoConnection::new();
        let mut options = Map::new();
        options.insert("status".to_string(), json!("bad_config"));
        options.insert("message".to_string(), json!("no host"));
        let outcome = connection.handle(execute("set_status", options));

        match &outcome.notices[0] {
            ConnectionToHost::SetStatus(status) => {
                assert_eq!(status.status, StatusLevel::BadConfig);
                assert_eq!(status.message.as_deref(), Some("no host"));
            }
            other => unreachable!("Expected SetStatus, got {:?}", other),
        }
    }

    #[test]
    fn test_http_request_echoes_path() {
        let mut connection = EchoConnection::new();
        connection.handle(init(HashMap::new()));
        let outcome = connection.handle(HostToConnection::HandleHttpRequest(HttpRequestWire {
            base_url: "/connections/echo".to_string(),
            path: "/status".to_string(),
            method: "GET".to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: None,
        }));

        let response: HttpResponseWire = serde_json::from_value(outcome.reply).unwrap();
        assert_eq!(response.status, 200);
        let body: Value = serde_json::from_str(response.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["path"], "/status");
        assert_eq!(body["label"], "echo");
    }

    #[test]
    fn test_destroy_exits() {
        let mut connection = EchoConnection::new();
        let outcome = connection.handle(HostToConnection::Destroy);
        assert!(outcome.exit);
        assert_eq!(outcome.reply, Value::Null);
    }
}
