//! Protocol handler bound to one registered connection channel.
//!
//! Outbound, every operation maps to exactly one verb. Calls wait for a
//! reply or the channel's call window; `variablesChanged` is the only
//! fire-and-forget notice. Every operation on an instance first checks that
//! the instance belongs to this handler's connection.
//!
//! Inbound, calls and notices are processed one at a time in arrival order
//! and each verb is translated into an effect on the host's collaborators.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::HandlerError;
use super::services::{ControlBridge, HostServices};
use crate::connections::ConnectionId;
use crate::controls::types::{ActionInstance, ControlId, FeedbackInstance};
use crate::ipc::IpcChannel;
use crate::ipc::protocol::{
    ConfigAndLabel, ConnectionToHost, Envelope, ExecuteActionRequest, HostToConnection,
    HttpRequestWire, HttpResponseWire, InitRequest, InitResponse, LearnActionRequest,
    LearnFeedbackRequest, LearnResponse, LogLevel, ParseVariablesResponse, RecordActionsRequest,
    UpdateActionsRequest, UpdateFeedbacksRequest, VariablesChangedNotice,
};

/// Handler for one registered connection.
pub struct ConnectionHandler {
    /// Connection this handler serves.
    connection_id: ConnectionId,
    /// Current label.
    label: RwLock<String>,
    /// Registered channel.
    channel: Arc<IpcChannel>,
    /// Host collaborators.
    services: HostServices,
    /// Controls, when attached.
    controls: Option<Weak<dyn ControlBridge>>,
    /// Set once `init` succeeded.
    initialized: AtomicBool,
    /// Reported by `init`.
    has_http_handler: AtomicBool,
    /// Reported by `init`.
    has_record_actions_handler: AtomicBool,
}

impl ConnectionHandler {
    /// Bind a handler to a registered channel.
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        label: impl Into<String>,
        channel: Arc<IpcChannel>,
        services: HostServices,
        controls: Option<Weak<dyn ControlBridge>>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            label: RwLock::new(label.into()),
            channel,
            services,
            controls,
            initialized: AtomicBool::new(false),
            has_http_handler: AtomicBool::new(false),
            has_record_actions_handler: AtomicBool::new(false),
        }
    }

    /// Connection this handler serves.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Current label.
    pub fn label(&self) -> String {
        self.label
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether `init` completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether the connection answers HTTP requests.
    pub fn has_http_handler(&self) -> bool {
        self.has_http_handler.load(Ordering::Acquire)
    }

    /// Whether the connection records actions.
    pub fn has_record_actions_handler(&self) -> bool {
        self.has_record_actions_handler.load(Ordering::Acquire)
    }

    /// The registered channel.
    pub fn channel(&self) -> &Arc<IpcChannel> {
        &self.channel
    }

    /// Close the channel.
    pub fn close(&self) {
        self.channel.close();
    }

    fn controls(&self) -> Option<Arc<dyn ControlBridge>> {
        self.controls.as_ref().and_then(Weak::upgrade)
    }

    fn check_owner(&self, owner: &str) -> Result<(), HandlerError> {
        if owner == self.connection_id {
            Ok(())
        } else {
            error!(
                "Refusing to send instance of {} to connection {}",
                owner, self.connection_id
            );
            Err(HandlerError::WrongConnection {
                expected: self.connection_id.clone(),
                actual: owner.to_string(),
            })
        }
    }

    /// Send `init` and record what the connection supports.
    pub async fn init(&self, request: InitRequest) -> Result<InitResponse, HandlerError> {
        let response: InitResponse = self
            .channel
            .call_typed(&HostToConnection::Init(request))
            .await?;
        self.has_http_handler
            .store(response.has_http_handler, Ordering::Release);
        self.has_record_actions_handler
            .store(response.has_record_actions_handler, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        Ok(response)
    }

    /// Run an action.
    pub async fn action_run(
        &self,
        control_id: &ControlId,
        action: &ActionInstance,
        surface_id: Option<String>,
    ) -> Result<(), HandlerError> {
        self.check_owner(&action.connection_id)?;
        self.channel
            .call(&HostToConnection::ExecuteAction(ExecuteActionRequest {
                action: action.to_wire(control_id),
                surface_id,
            }))
            .await?;
        Ok(())
    }

    /// Tell the connection an action was added or changed.
    pub async fn action_update(
        &self,
        control_id: &ControlId,
        action: &ActionInstance,
    ) -> Result<(), HandlerError> {
        self.check_owner(&action.connection_id)?;
        let mut actions = HashMap::new();
        actions.insert(action.id.clone(), Some(action.to_wire(control_id)));
        self.channel
            .call(&HostToConnection::UpdateActions(UpdateActionsRequest { actions }))
            .await?;
        Ok(())
    }

    /// Tell the connection an action was removed.
    pub async fn action_delete(&self, action: &ActionInstance) -> Result<(), HandlerError> {
        self.check_owner(&action.connection_id)?;
        let mut actions = HashMap::new();
        actions.insert(action.id.clone(), None);
        self.channel
            .call(&HostToConnection::UpdateActions(UpdateActionsRequest { actions }))
            .await?;
        Ok(())
    }

    /// Ask the connection for current option values of an action.
    pub async fn action_learn_values(
        &self,
        control_id: &ControlId,
        action: &ActionInstance,
    ) -> Result<Option<Map<String, Value>>, HandlerError> {
        self.check_owner(&action.connection_id)?;
        let response: LearnResponse = self
            .channel
            .call_typed(&HostToConnection::LearnAction(LearnActionRequest {
                action: action.to_wire(control_id),
            }))
            .await?;
        Ok(response.options)
    }

    /// Tell the connection a feedback was added or changed.
    pub async fn feedback_update(
        &self,
        control_id: &ControlId,
        feedback: &FeedbackInstance,
    ) -> Result<(), HandlerError> {
        self.check_owner(&feedback.connection_id)?;
        let mut feedbacks = HashMap::new();
        feedbacks.insert(feedback.id.clone(), Some(feedback.to_wire(control_id)));
        self.channel
            .call(&HostToConnection::UpdateFeedbacks(UpdateFeedbacksRequest { feedbacks }))
            .await?;
        Ok(())
    }

    /// Tell the connection a feedback was removed.
    pub async fn feedback_delete(&self, feedback: &FeedbackInstance) -> Result<(), HandlerError> {
        self.check_owner(&feedback.connection_id)?;
        let mut feedbacks = HashMap::new();
        feedbacks.insert(feedback.id.clone(), None);
        self.channel
            .call(&HostToConnection::UpdateFeedbacks(UpdateFeedbacksRequest { feedbacks }))
            .await?;
        Ok(())
    }

    /// Ask the connection for current option values of a feedback.
    pub async fn feedback_learn_values(
        &self,
        control_id: &ControlId,
        feedback: &FeedbackInstance,
    ) -> Result<Option<Map<String, Value>>, HandlerError> {
        self.check_owner(&feedback.connection_id)?;
        let response: LearnResponse = self
            .channel
            .call_typed(&HostToConnection::LearnFeedback(LearnFeedbackRequest {
                feedback: feedback.to_wire(control_id),
            }))
            .await?;
        Ok(response.options)
    }

    /// Re-send every feedback instance this connection owns.
    pub async fn send_all_feedback_instances(&self) -> Result<(), HandlerError> {
        let Some(controls) = self.controls() else {
            return Ok(());
        };
        let feedbacks: HashMap<String, Option<_>> = controls
            .feedbacks_for_connection(&self.connection_id)
            .into_iter()
            .map(|wire| (wire.id.clone(), Some(wire)))
            .collect();
        self.channel
            .call(&HostToConnection::UpdateFeedbacks(UpdateFeedbacksRequest { feedbacks }))
            .await?;
        Ok(())
    }

    /// Notify the connection that variables changed.
    pub async fn send_variables_changed(&self, variables: Vec<String>) -> Result<(), HandlerError> {
        self.channel
            .notify(&HostToConnection::VariablesChanged(VariablesChangedNotice {
                variables,
            }))
            .await?;
        Ok(())
    }

    /// Push a new label and configuration.
    pub async fn update_config_and_label(
        &self,
        label: String,
        config: Value,
    ) -> Result<(), HandlerError> {
        *self.label.write().unwrap_or_else(PoisonError::into_inner) = label.clone();
        self.channel
            .call(&HostToConnection::UpdateConfigAndLabel(ConfigAndLabel {
                label,
                config,
            }))
            .await?;
        Ok(())
    }

    /// Ask for the configuration field definitions.
    pub async fn request_config_fields(&self) -> Result<Value, HandlerError> {
        Ok(self.channel.call(&HostToConnection::GetConfigFields).await?)
    }

    /// Tell the connection it is being stopped.
    pub async fn destroy(&self) -> Result<(), HandlerError> {
        self.channel.call(&HostToConnection::Destroy).await?;
        Ok(())
    }

    /// Start or stop action recording.
    pub async fn start_stop_record_actions(&self, recording: bool) -> Result<(), HandlerError> {
        self.channel
            .call(&HostToConnection::StartStopRecordActions(RecordActionsRequest {
                recording,
            }))
            .await?;
        Ok(())
    }

    /// Forward an HTTP request.
    pub async fn handle_http_request(
        &self,
        request: HttpRequestWire,
    ) -> Result<HttpResponseWire, HandlerError> {
        if !self.has_http_handler() {
            return Err(HandlerError::NoHttpHandler(self.connection_id.clone()));
        }
        Ok(self
            .channel
            .call_typed(&HostToConnection::HandleHttpRequest(request))
            .await?)
    }

    /// Process inbound calls and notices until the channel closes.
    pub async fn run_inbound(&self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.handle_envelope(envelope).await;
        }
        debug!("Inbound loop for {} ended", self.connection_id);
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let verb = envelope.verb.clone();
        let correlation_id = envelope.correlation_id.filter(|_| envelope.expects_reply());

        let result = match envelope.decode::<ConnectionToHost>() {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!("Connection {} sent bad message: {}", self.connection_id, e);
                Err(e.to_string())
            }
        };

        match correlation_id {
            Some(id) => {
                if let Err(e) = self.channel.reply(id, &verb, result).await {
                    debug!("Could not reply to '{}' from {}: {}", verb, self.connection_id, e);
                }
            }
            None => {
                if let Err(message) = result {
                    warn!("'{}' from {} failed: {}", verb, self.connection_id, message);
                }
            }
        }
    }

    async fn handle_message(&self, message: ConnectionToHost) -> Result<Value, String> {
        let id = self.connection_id.as_str();
        match message {
            ConnectionToHost::Register(_) => Err("channel is already registered".to_string()),
            ConnectionToHost::LogMessage(log) => {
                let label = self.label();
                match log.level {
                    LogLevel::Debug => debug!(target: "connection", "[{}] {}", label, log.message),
                    LogLevel::Info => info!(target: "connection", "[{}] {}", label, log.message),
                    LogLevel::Warn => warn!(target: "connection", "[{}] {}", label, log.message),
                    LogLevel::Error => error!(target: "connection", "[{}] {}", label, log.message),
                }
                Ok(Value::Null)
            }
            ConnectionToHost::SetStatus(status) => {
                if self.services.status.set(id, status.status, status.message) {
                    debug!("Connection {} status now {:?}", id, status.status);
                }
                Ok(Value::Null)
            }
            ConnectionToHost::SetActionDefinitions { actions } => {
                let diff = self.services.definitions.set_action_definitions(id, actions);
                debug!(
                    "Connection {} actions: {} added, {} changed, {} removed",
                    id,
                    diff.added.len(),
                    diff.changed.len(),
                    diff.removed.len()
                );
                Ok(Value::Null)
            }
            ConnectionToHost::SetFeedbackDefinitions { feedbacks } => {
                let diff = self.services.definitions.set_feedback_definitions(id, feedbacks);
                debug!(
                    "Connection {} feedbacks: {} added, {} changed, {} removed",
                    id,
                    diff.added.len(),
                    diff.changed.len(),
                    diff.removed.len()
                );
                Ok(Value::Null)
            }
            ConnectionToHost::SetVariableDefinitions { variables } => {
                self.services.definitions.set_variable_definitions(id, variables);
                Ok(Value::Null)
            }
            ConnectionToHost::SetPresetDefinitions { presets } => {
                self.services.definitions.set_preset_definitions(id, presets);
                Ok(Value::Null)
            }
            ConnectionToHost::SetVariableValues { values } => {
                let label = self.label();
                let changed = self.services.variables.set_values(
                    &label,
                    values.into_iter().map(|v| (v.name, v.value)).collect(),
                );
                debug!("Connection {} changed {} variables", id, changed.len());
                Ok(Value::Null)
            }
            ConnectionToHost::UpdateFeedbackValues { values } => {
                if let Some(controls) = self.controls() {
                    controls.update_feedback_values(id, values);
                }
                Ok(Value::Null)
            }
            ConnectionToHost::SaveConfig(save) => {
                if !self.services.registry.save_config(id, save.config) {
                    warn!("Connection {} saved config but is no longer configured", id);
                }
                Ok(Value::Null)
            }
            ConnectionToHost::SendOsc(osc) => self.services.osc.send(id, osc).map(|_| Value::Null),
            ConnectionToHost::ParseVariablesInString(request) => {
                let parsed = self.services.variables.parse(&request.text);
                serde_json::to_value(ParseVariablesResponse {
                    text: parsed.text,
                    variable_ids: parsed.variable_ids,
                })
                .map_err(|e| e.to_string())
            }
            ConnectionToHost::UpgradedItems(items) => {
                if let Some(controls) = self.controls() {
                    controls.apply_upgraded_items(id, items);
                }
                Ok(Value::Null)
            }
            ConnectionToHost::RecordAction(action) => {
                self.services.recorder.record(id, action);
                Ok(Value::Null)
            }
            ConnectionToHost::SetCustomVariable(custom) => {
                self.services.variables.set_custom(&custom.name, custom.value);
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{ConnectionConfig, MemoryConnectionRegistry, StaticModuleCatalog};
    use crate::definitions::DefinitionsRegistry;
    use crate::host::osc::UdpOscSender;
    use crate::host::services::MemoryActionRecorder;
    use crate::host::status::StatusTracker;
    use crate::ipc::IpcError;
    use crate::ipc::protocol::{
        ActionWire, FeedbackValueUpdate, FeedbackWire, LogMessage, ParseVariablesRequest,
        SaveConfigMessage, SetStatusMessage, StatusLevel, UpgradedItemsMessage, VariableValue,
    };
    use crate::variables::{MemoryVariables, VariableStore};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::UnixStream;

    #[derive(Default)]
    struct RecordingBridge {
        feedback_values: Mutex<Vec<(String, Vec<FeedbackValueUpdate>)>>,
    }

    impl ControlBridge for RecordingBridge {
        fn actions_for_connection(&self, _connection_id: &str) -> Vec<ActionWire> {
            Vec::new()
        }

        fn feedbacks_for_connection(&self, connection_id: &str) -> Vec<FeedbackWire> {
            vec![FeedbackWire {
                id: "f1".to_string(),
                control_id: "c1".to_string(),
                feedback_type: format!("{}-fb", connection_id),
                options: Map::new(),
                is_inverted: false,
            }]
        }

        fn update_feedback_values(&self, connection_id: &str, values: Vec<FeedbackValueUpdate>) -> usize {
            let count = values.len();
            self.feedback_values
                .lock()
                .unwrap()
                .push((connection_id.to_string(), values));
            count
        }

        fn apply_upgraded_items(&self, _connection_id: &str, _items: UpgradedItemsMessage) {}

        fn prune_connection(&self, _connection_id: &str) -> usize {
            0
        }
    }

    struct Fixture {
        handler: Arc<ConnectionHandler>,
        peer: Arc<IpcChannel>,
        peer_inbound: mpsc::Receiver<Envelope>,
        services: HostServices,
        bridge: Arc<RecordingBridge>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MemoryConnectionRegistry::new([ConnectionConfig {
            id: "osc-1".to_string(),
            instance_type: "generic-osc".to_string(),
            label: "osc1".to_string(),
            enabled: true,
            config: json!({}),
            last_upgrade_index: None,
        }]));
        let services = HostServices {
            registry,
            modules: Arc::new(StaticModuleCatalog::default()),
            definitions: Arc::new(DefinitionsRegistry::new()),
            variables: Arc::new(MemoryVariables::new()),
            status: Arc::new(StatusTracker::new()),
            recorder: Arc::new(MemoryActionRecorder::new()),
            osc: Arc::new(UdpOscSender),
        };
        let bridge = Arc::new(RecordingBridge::default());
        let weak: Weak<dyn ControlBridge> = Arc::downgrade(&(bridge.clone() as Arc<dyn ControlBridge>));

        let (a, b) = UnixStream::pair().unwrap();
        let (host_channel, host_inbound) = IpcChannel::spawn(a, Duration::from_millis(500));
        let (peer, peer_inbound) = IpcChannel::spawn(b, Duration::from_millis(500));

        let handler = Arc::new(ConnectionHandler::new(
            "osc-1",
            "osc1",
            host_channel,
            services.clone(),
            Some(weak),
        ));
        let inbound_handler = handler.clone();
        tokio::spawn(async move { inbound_handler.run_inbound(host_inbound).await });

        Fixture {
            handler,
            peer,
            peer_inbound,
            services,
            bridge,
        }
    }

    #[tokio::test]
    async fn test_wrong_connection_is_refused_before_sending() {
        let mut f = fixture();
        let foreign = ActionInstance::new("osc-2", "go", Map::new());

        let result = f.handler.action_run(&ControlId::new("c1"), &foreign, None).await;
        assert!(matches!(result, Err(HandlerError::WrongConnection { .. })));
        assert!(f.peer_inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_action_run_sends_execute_action() {
        let mut f = fixture();
        let action = ActionInstance::new("osc-1", "go", Map::new());
        let action_id = action.id.clone();

        let peer = f.peer.clone();
        let responder = tokio::spawn(async move {
            let call = f.peer_inbound.recv().await.unwrap();
            peer.reply(call.correlation_id.unwrap(), &call.verb, Ok(Value::Null))
                .await
                .unwrap();
            call
        });

        f.handler
            .action_run(&ControlId::new("c1"), &action, Some("surface-1".to_string()))
            .await
            .unwrap();

        let call = responder.await.unwrap();
        match call.decode::<HostToConnection>().unwrap() {
            HostToConnection::ExecuteAction(request) => {
                assert_eq!(request.action.id, action_id);
                assert_eq!(request.action.control_id, "c1");
                assert_eq!(request.surface_id.as_deref(), Some("surface-1"));
            }
            other => unreachable!("Expected ExecuteAction, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let f = fixture();
        let result = f.handler.destroy().await;
        assert!(matches!(result, Err(HandlerError::Ipc(IpcError::Timeout { .. }))));
        assert!(result.unwrap_err().to_string().contains("destroy"));
    }

    #[tokio::test]
    async fn test_http_without_handler_is_refused() {
        let f = fixture();
        let result = f
            .handler
            .handle_http_request(HttpRequestWire {
                base_url: "/connections/osc-1".to_string(),
                path: "/".to_string(),
                method: "GET".to_string(),
                query: HashMap::new(),
                headers: HashMap::new(),
                body: None,
            })
            .await;
        assert!(matches!(result, Err(HandlerError::NoHttpHandler(_))));
    }

    #[tokio::test]
    async fn test_inbound_status_and_variables() {
        let f = fixture();

        f.peer
            .call(&ConnectionToHost::SetStatus(SetStatusMessage {
                status: StatusLevel::Ok,
                message: None,
            }))
            .await
            .unwrap();
        assert_eq!(
            f.services.status.get("osc-1").unwrap().level,
            StatusLevel::Ok
        );

        f.peer
            .call(&ConnectionToHost::SetVariableValues {
                values: vec![VariableValue {
                    name: "volume".to_string(),
                    value: json!(7),
                }],
            })
            .await
            .unwrap();
        assert_eq!(f.services.variables.get("osc1", "volume"), Some(json!(7)));

        let parsed = f
            .peer
            .call(&ConnectionToHost::ParseVariablesInString(ParseVariablesRequest {
                text: "vol $(osc1:volume)".to_string(),
                control_id: None,
            }))
            .await
            .unwrap();
        assert_eq!(parsed["text"], "vol 7");
    }

    #[tokio::test]
    async fn test_inbound_feedback_values_reach_controls() {
        let f = fixture();
        f.peer
            .call(&ConnectionToHost::UpdateFeedbackValues {
                values: vec![FeedbackValueUpdate {
                    id: "f1".to_string(),
                    control_id: "c1".to_string(),
                    value: json!(true),
                }],
            })
            .await
            .unwrap();

        let recorded = f.bridge.feedback_values.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "osc-1");
    }

    #[tokio::test]
    async fn test_save_config_persists_without_update_call() {
        let mut f = fixture();
        f.peer
            .call(&ConnectionToHost::SaveConfig(SaveConfigMessage {
                config: json!({ "port": 9000 }),
            }))
            .await
            .unwrap();

        assert_eq!(
            f.services.registry.get("osc-1").unwrap().config,
            json!({ "port": 9000 })
        );
        assert!(f.peer_inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_log_message_notice_gets_no_reply() {
        let f = fixture();
        f.peer
            .notify(&ConnectionToHost::LogMessage(LogMessage {
                level: LogLevel::Warn,
                message: "device slow".to_string(),
            }))
            .await
            .unwrap();
        f.peer
            .call(&ConnectionToHost::SetStatus(SetStatusMessage {
                status: StatusLevel::Ok,
                message: None,
            }))
            .await
            .unwrap();
        assert_eq!(f.peer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_all_feedback_instances() {
        let mut f = fixture();
        let peer = f.peer.clone();
        let responder = tokio::spawn(async move {
            let call = f.peer_inbound.recv().await.unwrap();
            peer.reply(call.correlation_id.unwrap(), &call.verb, Ok(Value::Null))
                .await
                .unwrap();
            call
        });

        f.handler.send_all_feedback_instances().await.unwrap();
        let call = responder.await.unwrap();
        assert_eq!(call.verb, "updateFeedbacks");
        assert_eq!(call.payload["feedbacks"]["f1"]["feedbackId"], "osc-1-fb");
    }
}
