//! Connection host: one supervised process and channel per connection.
//!
//! ```text
//!   queue_restart(id) ──► lifecycle queue ──► stop old ─► token ─► spawn
//!                                                                   │
//!   ChannelListener ──► RegistrationAttempt ──► register_channel ◄──┘
//!                                                  │ version, id, token
//!                                                  ▼
//!                                          ConnectionHandler ──► init
//! ```
//!
//! Every start and stop for a connection runs on that connection's
//! lifecycle queue, so they never overlap. Registration checks and handler
//! binding happen under the entry lock, so at most one channel is bound per
//! connection.

use chrono::Utc;
use semver::{Version, VersionReq};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::entry::{ConnectionEntry, ConnectionInfo, ConnectionPhase};
use super::error::{HostError, RegisterError};
use super::handler::ConnectionHandler;
use super::services::{ControlBridge, HostServices};
use crate::connections::{ConnectionConfig, ConnectionId, ModuleInfo};
use crate::ipc::RegistrationAttempt;
use crate::ipc::client::{
    ENV_CHANNEL_ADDRESS, ENV_CHANNEL_TOKEN, ENV_CONNECTION_ID, ENV_ENTRY_POINT, ENV_MANIFEST_PATH,
};
use crate::ipc::protocol::{InitRequest, REGISTER_VERB, RegisterRequest, StatusLevel};
use crate::supervisor::{ProcessEvent, ProcessSpec, ProcessSupervisor};
use crate::telemetry::{self, HostEvent};

/// Host settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Socket connection processes dial.
    pub socket_path: PathBuf,
    /// Reply window for calls to connections.
    pub ipc_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_timeout: Duration,
    /// Pause before restarting a crashed process.
    pub restart_delay: Duration,
    /// How long a new channel may take to register.
    pub register_timeout: Duration,
    /// API versions accepted at registration.
    pub api_version: VersionReq,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("surface-host").join("connections.sock"),
            ipc_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            register_timeout: Duration::from_secs(10),
            api_version: VersionReq {
                comparators: vec![
                    semver::Comparator {
                        op: semver::Op::GreaterEq,
                        major: 1,
                        minor: Some(0),
                        patch: Some(0),
                        pre: semver::Prerelease::EMPTY,
                    },
                    semver::Comparator {
                        op: semver::Op::Less,
                        major: 2,
                        minor: Some(0),
                        patch: Some(0),
                        pre: semver::Prerelease::EMPTY,
                    },
                ],
            },
        }
    }
}

/// Supervises every connection process and its channel.
pub struct ConnectionHost {
    /// Settings.
    config: HostConfig,
    /// Collaborators.
    services: HostServices,
    /// Runtime records by connection id.
    entries: Mutex<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
    /// Controls, once attached.
    controls: OnceLock<Weak<dyn ControlBridge>>,
    /// Whether action recording is active.
    recording: AtomicBool,
    /// Handle to self for spawned work.
    weak_self: Weak<ConnectionHost>,
}

impl ConnectionHost {
    /// Create a host.
    pub fn new(config: HostConfig, services: HostServices) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            services,
            entries: Mutex::new(HashMap::new()),
            controls: OnceLock::new(),
            recording: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Attach the controls side. Only the first call has an effect.
    pub fn attach_controls(&self, controls: Weak<dyn ControlBridge>) {
        if self.controls.set(controls).is_err() {
            warn!("Controls already attached to connection host");
        }
    }

    /// Host settings.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Host collaborators.
    pub fn services(&self) -> &HostServices {
        &self.services
    }

    fn controls(&self) -> Option<Arc<dyn ControlBridge>> {
        self.controls.get().and_then(Weak::upgrade)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: &str) -> Option<Arc<ConnectionEntry>> {
        self.entries().get(id).cloned()
    }

    /// Queue a job on a connection's lifecycle queue, creating the entry.
    ///
    /// The push happens under the entries lock so an entry is never removed
    /// while a job is being queued on it.
    fn push_job<F, Fut>(&self, id: &str, create: bool, job: F) -> bool
    where
        F: FnOnce(Arc<ConnectionHost>, Arc<ConnectionEntry>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let Some(host) = self.weak_self.upgrade() else {
            return false;
        };
        let mut entries = self.entries();
        let entry = match entries.get(id) {
            Some(entry) => entry.clone(),
            None if create => {
                let entry = Arc::new(ConnectionEntry::new(id));
                entries.insert(id.to_string(), entry.clone());
                entry
            }
            None => return false,
        };
        entry.queue.push(job(host, entry.clone()));
        true
    }

    /// Restart a connection.
    ///
    /// Stops any existing process, then starts a fresh one with a new token
    /// if the connection is configured and enabled. Otherwise the entry is
    /// removed once its queue is idle.
    pub fn queue_restart(&self, id: &str) {
        debug!("Queueing restart of {}", id);
        self.push_job(id, true, |host, entry| async move {
            host.restart_job(&entry).await;
        });
    }

    /// Stop a connection and remove its entry once idle.
    pub fn queue_stop(&self, id: &str) {
        debug!("Queueing stop of {}", id);
        self.push_job(id, false, |host, entry| async move {
            host.stop_entry(&entry).await;
            host.services.status.forget(&entry.id);
            host.remove_if_idle(&entry);
        });
    }

    /// Stop every connection.
    pub fn queue_stop_all(&self) {
        let ids: Vec<ConnectionId> = self.entries().keys().cloned().collect();
        for id in ids {
            self.queue_stop(&id);
        }
    }

    /// Stop every connection and wait for the stops to finish.
    pub async fn stop_all(&self) {
        self.queue_stop_all();
        let entries: Vec<Arc<ConnectionEntry>> = self.entries().values().cloned().collect();
        for entry in entries {
            entry.queue.wait_idle().await;
        }
        info!("All connections stopped");
    }

    /// Start every enabled connection in the registry.
    pub fn start_all(&self) {
        for id in self.services.registry.ids() {
            if self.services.registry.is_enabled(&id) {
                self.queue_restart(&id);
            }
        }
    }

    /// Wait until a connection's queued lifecycle work has finished.
    pub async fn wait_idle(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            entry.queue.wait_idle().await;
        }
    }

    async fn restart_job(&self, entry: &Arc<ConnectionEntry>) {
        self.stop_entry(entry).await;

        let Some(config) = self.services.registry.get(&entry.id) else {
            debug!("Connection {} is not configured, not starting", entry.id);
            self.services.status.forget(&entry.id);
            self.remove_if_idle(entry);
            return;
        };
        if !config.enabled {
            debug!("Connection {} is disabled, not starting", entry.id);
            self.services.status.forget(&entry.id);
            self.remove_if_idle(entry);
            return;
        }
        let Some(module) = self.services.modules.module(&config.instance_type) else {
            let e = HostError::UnknownModule(config.instance_type.clone());
            error!("Cannot start {}: {}", entry.id, e);
            self.services
                .status
                .set(&entry.id, StatusLevel::BadConfig, Some(e.to_string()));
            return;
        };

        if let Err(e) = self.start_process(entry, &config, &module) {
            error!("Failed to start {}: {}", entry.id, e);
            self.services
                .status
                .set(&entry.id, StatusLevel::ConnectionFailure, Some(e.to_string()));
        }
    }

    fn start_process(
        &self,
        entry: &Arc<ConnectionEntry>,
        config: &ConnectionConfig,
        module: &ModuleInfo,
    ) -> Result<(), HostError> {
        let token = Uuid::new_v4().to_string();
        let spec = self.process_spec(config, module, &token);

        let generation = {
            let mut state = entry.state();
            state.generation += 1;
            state.phase = ConnectionPhase::Starting;
            state.token = Some(token);
            state.generation
        };
        self.services
            .status
            .set(&entry.id, StatusLevel::Connecting, None);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = match ProcessSupervisor::start(entry.id.clone(), spec, events_tx) {
            Ok(supervisor) => Arc::new(supervisor),
            Err(e) => {
                let mut state = entry.state();
                state.token = None;
                state.phase = ConnectionPhase::Stopped;
                return Err(e.into());
            }
        };

        {
            let mut state = entry.state();
            state.supervisor = Some(supervisor);
            state.phase = ConnectionPhase::AwaitingRegistration;
            state.started_at = Some(Utc::now());
            state.registered_at = None;
        }

        let host = self.weak_self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            pump_process_events(host, entry, generation, events_rx).await;
        });
        Ok(())
    }

    fn process_spec(&self, config: &ConnectionConfig, module: &ModuleInfo, token: &str) -> ProcessSpec {
        let mut args = module.args.clone();
        let mut env = BTreeMap::new();
        env.insert(ENV_CONNECTION_ID.to_string(), config.id.clone());
        env.insert(
            ENV_CHANNEL_ADDRESS.to_string(),
            self.config.socket_path.display().to_string(),
        );
        env.insert(ENV_CHANNEL_TOKEN.to_string(), token.to_string());
        if let Some(entry_point) = &module.entry_point {
            args.push(entry_point.display().to_string());
            env.insert(ENV_ENTRY_POINT.to_string(), entry_point.display().to_string());
        }
        if let Some(manifest) = &module.manifest_path {
            env.insert(ENV_MANIFEST_PATH.to_string(), manifest.display().to_string());
        }

        ProcessSpec {
            command: module.command.clone(),
            args,
            env,
            working_dir: module.working_dir.clone(),
            kill_timeout: self.config.kill_timeout,
            restart_delay: self.config.restart_delay,
        }
    }

    /// Tear down process and channel without removing the entry.
    async fn stop_entry(&self, entry: &Arc<ConnectionEntry>) {
        let (supervisor, handler) = {
            let mut state = entry.state();
            state.token = None;
            state.generation += 1;
            if state.supervisor.is_some() || state.handler.is_some() {
                state.phase = ConnectionPhase::Stopping;
            }
            (state.supervisor.take(), state.handler.take())
        };

        if let Some(handler) = handler {
            if handler.is_initialized()
                && let Err(e) = handler.destroy().await
            {
                debug!("destroy for {} failed: {}", entry.id, e);
            }
            handler.close();
        }

        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
            info!("Stopped connection {}", entry.id);
            telemetry::audit().log(HostEvent::ConnectionStopped {
                connection_id: entry.id.clone(),
            });
        }

        {
            let mut state = entry.state();
            state.phase = ConnectionPhase::Stopped;
            state.started_at = None;
            state.registered_at = None;
        }
        self.services.definitions.forget_connection(&entry.id);
    }

    /// Remove an entry unless more work is queued behind the running job.
    fn remove_if_idle(&self, entry: &Arc<ConnectionEntry>) {
        let mut entries = self.entries();
        let idle = entry.queue.pending() <= 1 && entry.state().supervisor.is_none();
        if idle && entries.get(&entry.id).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(&entry.id);
            debug!("Removed entry for {}", entry.id);
        }
    }

    /// Accept registration attempts until the listener goes away.
    pub async fn run_registrations(&self, mut attempts: mpsc::Receiver<RegistrationAttempt>) {
        while let Some(attempt) = attempts.recv().await {
            let connection_id = attempt.request.connection_id.clone();
            match self.register_channel(attempt).await {
                Ok(()) => debug!("Bound channel for {}", connection_id),
                Err(e) => debug!("Registration of {} ended: {}", connection_id, e),
            }
        }
        debug!("Registration loop ended");
    }

    /// Handle one registration attempt.
    ///
    /// On success the channel is acknowledged, bound to a new handler, and
    /// `init` is issued in the background. On failure the channel is closed
    /// without a reply.
    pub async fn register_channel(&self, attempt: RegistrationAttempt) -> Result<(), RegisterError> {
        let RegistrationAttempt {
            channel,
            inbound,
            correlation_id,
            request,
        } = attempt;

        let (entry, handler) = match self.bind_channel(&request, &channel) {
            Ok(bound) => bound,
            Err(e) => {
                warn!("Rejected registration for {}: {}", request.connection_id, e);
                telemetry::audit().log(HostEvent::RegistrationRejected {
                    connection_id: request.connection_id.clone(),
                    reason: e.to_string(),
                });
                channel.close();
                return Err(e);
            }
        };

        info!(
            "Connection {} registered (api {})",
            request.connection_id, request.api_version
        );
        telemetry::audit().log(HostEvent::ConnectionRegistered {
            connection_id: request.connection_id.clone(),
            api_version: request.api_version.clone(),
        });
        if let Err(e) = channel
            .reply(correlation_id, REGISTER_VERB, Ok(Value::Null))
            .await
        {
            warn!("Failed to acknowledge {}: {}", request.connection_id, e);
        }

        let host = self.weak_self.clone();
        let inbound_handler = handler.clone();
        let inbound_entry = entry.clone();
        tokio::spawn(async move {
            inbound_handler.run_inbound(inbound).await;
            if let Some(host) = host.upgrade() {
                host.channel_closed(&inbound_entry, &inbound_handler);
            }
        });

        let host = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(host) = host.upgrade() {
                host.init_connection(&entry, &handler).await;
            }
        });
        Ok(())
    }

    fn bind_channel(
        &self,
        request: &RegisterRequest,
        channel: &Arc<crate::ipc::IpcChannel>,
    ) -> Result<(Arc<ConnectionEntry>, Arc<ConnectionHandler>), RegisterError> {
        let version = Version::parse(&request.api_version)
            .map_err(|_| RegisterError::InvalidVersion(request.api_version.clone()))?;
        if !self.config.api_version.matches(&version) {
            return Err(RegisterError::UnsupportedVersion {
                version: request.api_version.clone(),
                supported: self.config.api_version.to_string(),
            });
        }

        let id = request.connection_id.as_str();
        let config = self
            .services
            .registry
            .get(id)
            .ok_or_else(|| RegisterError::UnknownConnection(id.to_string()))?;
        let entry = self
            .entry(id)
            .ok_or_else(|| RegisterError::UnknownConnection(id.to_string()))?;

        let mut state = entry.state();
        if state.handler.is_some() {
            return Err(RegisterError::AlreadyRegistered(id.to_string()));
        }
        match &state.token {
            Some(token) if *token == request.token => {}
            _ => return Err(RegisterError::TokenMismatch(id.to_string())),
        }

        let handler = Arc::new(ConnectionHandler::new(
            id,
            config.label,
            channel.clone(),
            self.services.clone(),
            self.controls.get().cloned(),
        ));
        state.handler = Some(handler.clone());
        state.registered_at = Some(Utc::now());
        drop(state);

        Ok((entry, handler))
    }

    fn is_bound(entry: &ConnectionEntry, handler: &Arc<ConnectionHandler>) -> bool {
        entry
            .state()
            .handler
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, handler))
    }

    async fn init_connection(&self, entry: &Arc<ConnectionEntry>, handler: &Arc<ConnectionHandler>) {
        let Some(config) = self.services.registry.get(&entry.id) else {
            return;
        };

        let (actions, feedbacks) = match self.controls() {
            Some(controls) => (
                controls
                    .actions_for_connection(&entry.id)
                    .into_iter()
                    .map(|a| (a.id.clone(), a))
                    .collect(),
                controls
                    .feedbacks_for_connection(&entry.id)
                    .into_iter()
                    .map(|f| (f.id.clone(), f))
                    .collect(),
            ),
            None => (HashMap::new(), HashMap::new()),
        };

        let request = InitRequest {
            label: config.label,
            config: config.config,
            last_upgrade_index: config.last_upgrade_index,
            actions,
            feedbacks,
        };

        match handler.init(request).await {
            Ok(response) => {
                if let Some(index) = response.new_upgrade_index {
                    self.services.registry.set_upgrade_index(&entry.id, index);
                }
                if let Some(updated) = response.updated_config {
                    self.services.registry.save_config(&entry.id, updated);
                }
                {
                    let mut state = entry.state();
                    if state.handler.as_ref().is_some_and(|h| Arc::ptr_eq(h, handler)) {
                        state.phase = ConnectionPhase::Running;
                    }
                }
                info!("Connection {} initialized", entry.id);

                if self.recording.load(Ordering::Acquire)
                    && handler.has_record_actions_handler()
                    && let Err(e) = handler.start_stop_record_actions(true).await
                {
                    warn!("Failed to start recording on {}: {}", entry.id, e);
                }
            }
            Err(e) => {
                error!("init of {} failed: {}", entry.id, e);
                if Self::is_bound(entry, handler) {
                    self.queue_restart(&entry.id);
                }
            }
        }
    }

    fn channel_closed(&self, entry: &ConnectionEntry, handler: &Arc<ConnectionHandler>) {
        let mut state = entry.state();
        if state.handler.as_ref().is_some_and(|h| Arc::ptr_eq(h, handler)) {
            state.handler = None;
            state.registered_at = None;
            if state.phase == ConnectionPhase::Running {
                state.phase = ConnectionPhase::AwaitingRegistration;
            }
            debug!("Channel for {} closed", entry.id);
        }
    }

    fn process_crashed(&self, entry: &ConnectionEntry, generation: u64) {
        let handler = {
            let mut state = entry.state();
            if state.generation != generation {
                return;
            }
            state.phase = ConnectionPhase::Crashed;
            state.registered_at = None;
            state.handler.take()
        };
        if let Some(handler) = handler {
            handler.close();
        }
        self.services.status.set(
            &entry.id,
            StatusLevel::UnknownError,
            Some("process crashed".to_string()),
        );
    }

    fn process_started(&self, entry: &ConnectionEntry, generation: u64) {
        let mut state = entry.state();
        if state.generation == generation && state.phase == ConnectionPhase::Crashed {
            state.phase = ConnectionPhase::AwaitingRegistration;
        }
    }

    /// The initialized handler of a connection.
    ///
    /// `None` means the connection is currently unavailable.
    pub fn get_handler(&self, id: &str) -> Option<Arc<ConnectionHandler>> {
        let entry = self.entry(id)?;
        let state = entry.state();
        state.handler.clone().filter(|h| h.is_initialized())
    }

    /// Every initialized handler.
    pub fn bound_handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        let entries: Vec<Arc<ConnectionEntry>> = self.entries().values().cloned().collect();
        entries
            .iter()
            .filter_map(|entry| entry.state().handler.clone())
            .filter(|h| h.is_initialized())
            .collect()
    }

    /// Re-send every feedback instance to every bound handler.
    pub fn resubscribe_all_feedbacks(&self) {
        for handler in self.bound_handlers() {
            tokio::spawn(async move {
                if let Err(e) = handler.send_all_feedback_instances().await {
                    warn!(
                        "Failed to resubscribe feedbacks on {}: {}",
                        handler.connection_id(),
                        e
                    );
                }
            });
        }
    }

    /// Fan out changed variable names to every bound handler.
    pub fn variables_changed(&self, variables: Vec<String>) {
        if variables.is_empty() {
            return;
        }
        for handler in self.bound_handlers() {
            let variables = variables.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.send_variables_changed(variables).await {
                    debug!(
                        "variablesChanged to {} failed: {}",
                        handler.connection_id(),
                        e
                    );
                }
            });
        }
    }

    /// Start or stop action recording on every capable connection.
    pub fn start_stop_record_actions(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
        for handler in self.bound_handlers() {
            if !handler.has_record_actions_handler() {
                continue;
            }
            tokio::spawn(async move {
                if let Err(e) = handler.start_stop_record_actions(recording).await {
                    warn!(
                        "Failed to toggle recording on {}: {}",
                        handler.connection_id(),
                        e
                    );
                }
            });
        }
    }

    /// Whether action recording is active.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// React to a saved connection configuration.
    ///
    /// A running, still-enabled connection gets `updateConfigAndLabel`;
    /// anything else is restarted, which also covers enabling and disabling.
    pub fn connection_config_changed(&self, id: &str) {
        let config = self.services.registry.get(id);
        match (config, self.get_handler(id)) {
            (Some(config), Some(handler)) if config.enabled => {
                tokio::spawn(async move {
                    if let Err(e) = handler
                        .update_config_and_label(config.label, config.config)
                        .await
                    {
                        warn!("updateConfigAndLabel to {} failed: {}", config.id, e);
                    }
                });
            }
            _ => self.queue_restart(id),
        }
    }

    /// Delete a connection.
    ///
    /// Prunes its instances from every control first, so the process can
    /// still unsubscribe them, then removes it from the registry, queues a
    /// stop and forgets its definitions, status and variables.
    pub fn delete_connection(&self, id: &str) {
        if let Some(controls) = self.controls() {
            let removed = controls.prune_connection(id);
            debug!("Pruned {} instances of {}", removed, id);
        }
        let config = self.services.registry.remove(id);
        self.queue_stop(id);
        self.services.definitions.forget_connection(id);
        self.services.status.forget(id);
        if let Some(config) = config {
            self.services.variables.forget_label(&config.label);
        }
        info!("Deleted connection {}", id);
    }

    /// Diagnostic snapshot of one connection.
    pub fn connection_info(&self, id: &str) -> Option<ConnectionInfo> {
        self.entry(id).map(|entry| entry.info())
    }

    /// Diagnostic snapshot of every connection with an entry.
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let entries: Vec<Arc<ConnectionEntry>> = self.entries().values().cloned().collect();
        let mut infos: Vec<ConnectionInfo> = entries.iter().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    #[cfg(test)]
    pub(crate) fn issued_token(&self, id: &str) -> Option<String> {
        self.entry(id).and_then(|entry| entry.state().token.clone())
    }
}

async fn pump_process_events(
    host: Weak<ConnectionHost>,
    entry: Arc<ConnectionEntry>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout(line) => debug!(target: "connection", "[{}] {}", entry.id, line),
            ProcessEvent::Stderr(line) => warn!(target: "connection", "[{}] {}", entry.id, line),
            ProcessEvent::Started { pid } => {
                telemetry::audit().log(HostEvent::ConnectionStarted {
                    connection_id: entry.id.clone(),
                    pid,
                });
                if let Some(host) = host.upgrade() {
                    host.process_started(&entry, generation);
                }
            }
            ProcessEvent::Crashed { code } => {
                warn!("Connection {} crashed (code {:?})", entry.id, code);
                telemetry::audit().log(HostEvent::ConnectionExited {
                    connection_id: entry.id.clone(),
                    code,
                    expected: false,
                });
                if let Some(host) = host.upgrade() {
                    host.process_crashed(&entry, generation);
                }
            }
            ProcessEvent::Stopped { code } => {
                telemetry::audit().log(HostEvent::ConnectionExited {
                    connection_id: entry.id.clone(),
                    code,
                    expected: true,
                });
            }
        }
    }
}
