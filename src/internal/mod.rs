//! Internal pseudo-connection.
//!
//! Actions and feedbacks owned by the reserved connection id `internal`
//! never leave the host. They drive page navigation, delayed-action
//! aborts, and feedbacks derived from host state.
//!
//! ```text
//!   HostDispatch ──► execute_action ──► PageController / ActionRunner
//!   ControlStore ──► evaluate_feedback ◄── pages, statuses, busy flags
//! ```

pub mod pages;

pub use pages::{PageController, SimplePages};

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connections::INTERNAL_CONNECTION_ID;
use crate::controls::runner::ActionRunner;
use crate::controls::types::{ActionInstance, ControlId, FeedbackInstance};
use crate::definitions::{
    ActionDefinition, DefinitionsRegistry, FeedbackDefinition, FeedbackKind, OptionField,
};
use crate::host::{StatusCategory, StatusTracker};

const REFRESH_CAPACITY: usize = 16;

/// Value of the `connection` option meaning every connection.
pub const ALL_CONNECTIONS: &str = "all";

fn option_field(id: &str, label: &str, field_type: &str, default: Value) -> OptionField {
    OptionField {
        id: id.to_string(),
        label: label.to_string(),
        field_type: field_type.to_string(),
        default: Some(default),
    }
}

fn option_u32(options: &Map<String, Value>, key: &str) -> Option<u32> {
    match options.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn option_str<'a>(options: &'a Map<String, Value>, key: &str) -> &'a str {
    options.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Colours drawn for a status category.
pub fn status_colors(category: StatusCategory) -> Map<String, Value> {
    let colors = match category {
        StatusCategory::Good => json!({ "color": 0xffffff, "bgcolor": 0x00c800 }),
        StatusCategory::Warning => json!({ "color": 0x000000, "bgcolor": 0xf29041 }),
        StatusCategory::Error => json!({ "color": 0xffffff, "bgcolor": 0xff0000 }),
    };
    match colors {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The `internal` connection.
pub struct InternalModule {
    pages: Arc<dyn PageController>,
    runner: Arc<ActionRunner>,
    status: Arc<StatusTracker>,
    refresh: broadcast::Sender<()>,
}

impl InternalModule {
    /// Create the module.
    pub fn new(
        pages: Arc<dyn PageController>,
        runner: Arc<ActionRunner>,
        status: Arc<StatusTracker>,
    ) -> Self {
        let (refresh, _) = broadcast::channel(REFRESH_CAPACITY);
        Self {
            pages,
            runner,
            status,
            refresh,
        }
    }

    /// Action and feedback types offered.
    pub fn definitions() -> (Vec<ActionDefinition>, Vec<FeedbackDefinition>) {
        let action = |id: &str, name: &str, options: Vec<OptionField>| ActionDefinition {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            options,
            has_learn: false,
        };
        let actions = vec![
            action(
                "set_page",
                "Set page",
                vec![option_field("page", "Page", "number", json!(1))],
            ),
            action("inc_page", "Next page", vec![]),
            action("dec_page", "Previous page", vec![]),
            action("abort_all_delayed", "Abort all delayed actions", vec![]),
            action(
                "abort_control_delayed",
                "Abort delayed actions on a control",
                vec![
                    option_field("control", "Control (empty for this one)", "textinput", json!("")),
                    option_field("skip_release", "Skip release actions", "checkbox", json!(false)),
                ],
            ),
        ];

        let feedbacks = vec![
            FeedbackDefinition {
                id: "connection_status".to_string(),
                name: "Connection status".to_string(),
                kind: FeedbackKind::Advanced,
                description: Some("Colour by the status of a connection".to_string()),
                default_style: None,
                options: vec![option_field(
                    "connection",
                    "Connection",
                    "textinput",
                    json!(ALL_CONNECTIONS),
                )],
                has_learn: false,
                show_invert: false,
            },
            FeedbackDefinition {
                id: "page_is".to_string(),
                name: "Page is".to_string(),
                kind: FeedbackKind::Boolean,
                description: None,
                default_style: Some(status_colors(StatusCategory::Good)),
                options: vec![option_field("page", "Page", "number", json!(1))],
                has_learn: false,
                show_invert: true,
            },
            FeedbackDefinition {
                id: "actions_running".to_string(),
                name: "Delayed actions running".to_string(),
                kind: FeedbackKind::Boolean,
                description: None,
                default_style: Some(status_colors(StatusCategory::Warning)),
                options: vec![],
                has_learn: false,
                show_invert: true,
            },
        ];
        (actions, feedbacks)
    }

    /// Publish the definitions under the `internal` id.
    pub fn register(definitions: &DefinitionsRegistry) {
        let (actions, feedbacks) = Self::definitions();
        definitions.set_action_definitions(INTERNAL_CONNECTION_ID, actions);
        definitions.set_feedback_definitions(INTERNAL_CONNECTION_ID, feedbacks);
    }

    /// Run one internal action.
    pub fn execute_action(&self, control_id: &ControlId, action: &ActionInstance, surface_id: Option<&str>) {
        debug!(
            "Internal action '{}' from {} (surface {:?})",
            action.action_type, control_id, surface_id
        );
        match action.action_type.as_str() {
            "set_page" => match option_u32(&action.options, "page") {
                Some(page) => {
                    if !self.pages.set_page(page) {
                        debug!("Page {} unchanged or out of range", page);
                    }
                }
                None => warn!("set_page on {} has no valid page", control_id),
            },
            "inc_page" => {
                self.pages.inc_page();
            }
            "dec_page" => {
                self.pages.dec_page();
            }
            "abort_all_delayed" => {
                let aborted = self.runner.abort_all();
                info!("Aborted {} delayed actions", aborted);
            }
            "abort_control_delayed" => {
                let target = match option_str(&action.options, "control") {
                    "" => control_id.clone(),
                    other => ControlId::new(other),
                };
                let skip_release = action
                    .options
                    .get("skip_release")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let aborted = self.runner.abort_control_delayed(&target, skip_release);
                debug!("Aborted {} delayed actions on {}", aborted, target);
            }
            other => warn!("Unknown internal action '{}'", other),
        }
    }

    /// Current value of an internal feedback, `None` for unknown types.
    pub fn evaluate_feedback(&self, control_id: &ControlId, feedback: &FeedbackInstance) -> Option<Value> {
        match feedback.feedback_type.as_str() {
            "connection_status" => {
                let category = match option_str(&feedback.options, "connection") {
                    "" | ALL_CONNECTIONS => self.status.worst(),
                    id => self.status.category(id).unwrap_or(StatusCategory::Good),
                };
                Some(Value::Object(status_colors(category)))
            }
            "page_is" => {
                let page = option_u32(&feedback.options, "page");
                Some(Value::Bool(page == Some(self.pages.current_page())))
            }
            "actions_running" => Some(Value::Bool(self.runner.is_busy(control_id))),
            other => {
                debug!("Unknown internal feedback '{}'", other);
                None
            }
        }
    }

    /// Ask for internal feedbacks to be re-evaluated.
    pub fn request_refresh(&self) {
        let _ = self.refresh.send(());
    }

    /// Receive refresh requests.
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<()> {
        self.refresh.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::redraw::BroadcastRedraw;
    use crate::ipc::protocol::StatusLevel;

    fn module() -> (InternalModule, Arc<SimplePages>, Arc<StatusTracker>) {
        let pages = Arc::new(SimplePages::new(5));
        let status = Arc::new(StatusTracker::new());
        let runner = ActionRunner::new(Arc::new(BroadcastRedraw::new()));
        let module = InternalModule::new(pages.clone(), runner, status.clone());
        (module, pages, status)
    }

    fn action(action_type: &str, options: Value) -> ActionInstance {
        let options = options.as_object().cloned().unwrap_or_default();
        ActionInstance::new(INTERNAL_CONNECTION_ID, action_type, options)
    }

    #[test]
    fn test_definitions_registered_under_internal() {
        let registry = DefinitionsRegistry::new();
        InternalModule::register(&registry);
        assert!(registry.action_definition("internal", "set_page").is_some());
        let status = registry
            .feedback_definition("internal", "connection_status")
            .unwrap();
        assert_eq!(status.kind, FeedbackKind::Advanced);
        assert_eq!(
            registry.default_action_options("internal", "set_page").unwrap()["page"],
            1
        );
    }

    #[tokio::test]
    async fn test_page_actions() {
        let (module, pages, _) = module();
        let control = ControlId::new("c1");

        module.execute_action(&control, &action("set_page", json!({ "page": "4" })), None);
        assert_eq!(pages.current_page(), 4);
        module.execute_action(&control, &action("inc_page", json!({})), None);
        module.execute_action(&control, &action("inc_page", json!({})), None);
        assert_eq!(pages.current_page(), 1);
        module.execute_action(&control, &action("dec_page", json!({})), None);
        assert_eq!(pages.current_page(), 5);
        module.execute_action(&control, &action("set_page", json!({ "page": 9 })), None);
        assert_eq!(pages.current_page(), 5);
    }

    #[tokio::test]
    async fn test_page_is_feedback() {
        let (module, pages, _) = module();
        let control = ControlId::new("c1");
        let mut options = Map::new();
        options.insert("page".to_string(), json!(2));
        let feedback = FeedbackInstance::new(INTERNAL_CONNECTION_ID, "page_is", options);

        assert_eq!(module.evaluate_feedback(&control, &feedback), Some(json!(false)));
        pages.set_page(2);
        assert_eq!(module.evaluate_feedback(&control, &feedback), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_connection_status_feedback() {
        let (module, _, status) = module();
        let control = ControlId::new("c1");
        let mut options = Map::new();
        options.insert("connection".to_string(), json!("osc-1"));
        let single = FeedbackInstance::new(INTERNAL_CONNECTION_ID, "connection_status", options);
        let all = FeedbackInstance::new(INTERNAL_CONNECTION_ID, "connection_status", Map::new());

        status.set("osc-1", StatusLevel::Ok, None);
        status.set("osc-2", StatusLevel::ConnectionFailure, None);

        let value = module.evaluate_feedback(&control, &single).unwrap();
        assert_eq!(value["bgcolor"], 0x00c800);
        let value = module.evaluate_feedback(&control, &all).unwrap();
        assert_eq!(value["bgcolor"], 0xff0000);
    }

    #[tokio::test]
    async fn test_unknown_feedback_has_no_value() {
        let (module, _, _) = module();
        let feedback = FeedbackInstance::new(INTERNAL_CONNECTION_ID, "nope", Map::new());
        assert!(module.evaluate_feedback(&ControlId::new("c1"), &feedback).is_none());
    }
}
