//! Host wiring and lifecycle management.
//!
//! Builds every component from configuration, connects the event sources to
//! the controls that react to them, and runs until a shutdown signal.
//!
//! ```text
//!   ChannelListener ──attempts──► ConnectionHost ◄──Weak── HostDispatch
//!                                      │    ▲                   ▲
//!                          ControlBridge    │                   │
//!                                      ▼    │                   │
//!                                  ControlStore ────────────────┘
//!                                      ▲
//!   status / variables / pages / busy / internal refresh (forwarders)
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connections::{MemoryConnectionRegistry, StaticModuleCatalog};
use crate::controls::{
    ActionRunner, BroadcastRedraw, ControlServices, ControlStore, HostDispatch,
};
use crate::definitions::DefinitionsRegistry;
use crate::host::osc::UdpOscSender;
use crate::host::{
    ConnectionHost, ControlBridge, HostServices, MemoryActionRecorder, StatusTracker,
};
use crate::http::HttpBridge;
use crate::internal::{InternalModule, PageController, SimplePages};
use crate::ipc::{ChannelListener, ListenerConfig};
use crate::telemetry::{self, HostEvent};
use crate::variables::{MemoryVariables, VariableStore};

/// Capacity of the registration queue between listener and host.
const REGISTRATION_QUEUE: usize = 32;

/// How long background tasks get to finish after shutdown.
const TASK_GRACE: Duration = Duration::from_secs(2);

/// Every long-lived component of a running host.
pub struct HostRuntime {
    /// Connection processes and their channels.
    pub host: Arc<ConnectionHost>,
    /// Every control.
    pub controls: Arc<ControlStore>,
    /// Delayed-action timers.
    pub runner: Arc<ActionRunner>,
    /// Page navigation.
    pub pages: Arc<SimplePages>,
    /// The `internal` connection.
    pub internal: Arc<InternalModule>,
    /// Variable values.
    pub variables: Arc<MemoryVariables>,
    /// Connection statuses.
    pub status: Arc<StatusTracker>,
    /// Published catalogs.
    pub definitions: Arc<DefinitionsRegistry>,
    /// Redraw signals.
    pub redraw: Arc<BroadcastRedraw>,
    /// Recorded actions.
    pub recorder: Arc<MemoryActionRecorder>,
}

impl HostRuntime {
    /// Build every component from configuration.
    ///
    /// Nothing is started; see [`HostRuntime::start`].
    ///
    /// # Errors
    ///
    /// Returns an error when the host settings are invalid.
    pub fn build(config: &Config) -> Result<Self> {
        let host_config = config.host_config().context("Invalid host configuration")?;

        for connection in config.connections_without_module() {
            warn!(
                "Connection {} uses unknown type '{}' and cannot be started",
                connection.id, connection.instance_type
            );
        }

        let registry = Arc::new(MemoryConnectionRegistry::new(config.connections.clone()));
        let definitions = Arc::new(DefinitionsRegistry::new());
        InternalModule::register(&definitions);
        let variables = Arc::new(MemoryVariables::new());
        let status = Arc::new(StatusTracker::new());
        let recorder = Arc::new(MemoryActionRecorder::new());

        let host = ConnectionHost::new(
            host_config,
            HostServices {
                registry: registry.clone(),
                modules: Arc::new(StaticModuleCatalog::new(config.module_infos())),
                definitions: definitions.clone(),
                variables: variables.clone(),
                status: status.clone(),
                recorder: recorder.clone(),
                osc: Arc::new(UdpOscSender),
            },
        );

        let redraw = Arc::new(BroadcastRedraw::new());
        let runner = ActionRunner::new(redraw.clone());
        let pages = Arc::new(SimplePages::new(config.pages.count));
        let internal = Arc::new(InternalModule::new(
            pages.clone(),
            runner.clone(),
            status.clone(),
        ));
        let dispatch = Arc::new(HostDispatch::new(
            Arc::downgrade(&host),
            internal.clone(),
            registry.clone(),
        ));

        let controls = Arc::new(ControlStore::new(ControlServices {
            runner: runner.clone(),
            dispatch,
            definitions: definitions.clone(),
            status: status.clone(),
            variables: variables.clone(),
            pages: pages.clone(),
            redraw: redraw.clone(),
            internal: internal.clone(),
            registry,
        }));
        let bridge: Weak<dyn ControlBridge> = Arc::downgrade(&controls) as Weak<dyn ControlBridge>;
        host.attach_controls(bridge);

        Ok(Self {
            host,
            controls,
            runner,
            pages,
            internal,
            variables,
            status,
            definitions,
            redraw,
            recorder,
        })
    }

    /// Route status, variable, page, busy and refresh events to the controls.
    pub fn spawn_forwarders(&self, shutdown_rx: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let controls = self.controls.clone();
        handles.push(forward(
            "status",
            self.status.subscribe(),
            shutdown_rx.clone(),
            move |change| {
                let redrawn = controls.connection_status_changed(&change.connection_id);
                controls.refresh_internal_feedbacks();
                debug!(
                    "Status of {} changed, {} controls redrawn",
                    change.connection_id, redrawn
                );
            },
        ));

        let controls = self.controls.clone();
        let host = self.host.clone();
        handles.push(forward(
            "variables",
            self.variables.subscribe(),
            shutdown_rx.clone(),
            move |names: Vec<String>| {
                controls.variables_changed(&names);
                host.variables_changed(names);
            },
        ));

        let controls = self.controls.clone();
        handles.push(forward(
            "busy",
            self.runner.subscribe_busy(),
            shutdown_rx.clone(),
            move |_| {
                controls.refresh_internal_feedbacks();
            },
        ));

        let controls = self.controls.clone();
        handles.push(forward(
            "internal",
            self.internal.subscribe_refresh(),
            shutdown_rx.clone(),
            move |()| {
                controls.refresh_internal_feedbacks();
            },
        ));

        let controls = self.controls.clone();
        let mut page_rx = self.pages.subscribe();
        let mut shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = page_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let page = *page_rx.borrow_and_update();
                        debug!("Page changed to {}", page);
                        controls.refresh_internal_feedbacks();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }

    /// Bind the channel socket, accept registrations and start every
    /// enabled connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be bound.
    pub fn start(&self, shutdown_rx: &watch::Receiver<bool>) -> Result<(PathBuf, Vec<JoinHandle<()>>)> {
        let config = self.host.config();
        let listener = ChannelListener::bind(ListenerConfig {
            socket_path: config.socket_path.clone(),
            call_timeout: config.ipc_timeout,
            register_timeout: config.register_timeout,
        })
        .with_context(|| format!("Failed to bind channel socket {:?}", config.socket_path))?;
        let socket_path = listener.path().to_path_buf();

        let (attempt_tx, attempt_rx) = mpsc::channel(REGISTRATION_QUEUE);
        let listener_handle = tokio::spawn(listener.run(attempt_tx, shutdown_rx.clone()));

        let host = self.host.clone();
        let registrations = tokio::spawn(async move {
            host.run_registrations(attempt_rx).await;
        });

        self.host.start_all();
        Ok((socket_path, vec![listener_handle, registrations]))
    }

    /// Stop every connection and cancel pending timers.
    pub async fn stop(&self) {
        let aborted = self.runner.abort_all();
        if aborted > 0 {
            debug!("Aborted {} delayed actions", aborted);
        }
        self.host.stop_all().await;
    }
}

/// Run `on_event` for every event on `rx` until shutdown or close.
fn forward<T, F>(
    what: &'static str,
    mut rx: broadcast::Receiver<T>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut on_event: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => on_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("{} forwarder missed {} events", what, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} forwarder stopped", what);
    })
}

/// Run the host until interrupted.
pub fn run_host(config: &Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(serve(config))
}

async fn serve(config: &Config) -> Result<()> {
    let started = Instant::now();
    let runtime = HostRuntime::build(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = runtime.spawn_forwarders(&shutdown_rx);
    let (socket_path, listener_tasks) = runtime.start(&shutdown_rx)?;
    tasks.extend(listener_tasks);

    telemetry::audit().log(HostEvent::HostStart {
        pid: std::process::id(),
        connections: config.connections.len(),
    });
    info!(
        "Host running with {} connections, channel socket {:?}",
        config.connections.len(),
        socket_path
    );

    if config.http.is_enabled() {
        let listen = config.http.listen_addr()?;
        let bridge = HttpBridge::new(listen, runtime.host.clone(), shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = bridge.run().await {
                error!("HTTP bridge error: {}", e);
            }
        }));
    }

    wait_for_signal().await?;
    info!("Shutting down");

    runtime.stop().await;
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if tokio::time::timeout(TASK_GRACE, task).await.is_err() {
            debug!("Background task did not finish in time");
        }
    }

    telemetry::audit().log(HostEvent::HostStop {
        duration_sec: started.elapsed().as_secs(),
    });
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl-C")?,
        _ = terminate.recv() => debug!("Received SIGTERM"),
    }
    Ok(())
}
