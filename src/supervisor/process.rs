//! One supervised OS process per connection.
//!
//! # Restart Policy
//!
//! The process is restarted every time it exits, after a fixed delay, with
//! no limit on the number of restarts. Only [`ProcessSupervisor::stop`]
//! ends the loop.
//!
//! ```text
//!   spawn ──> Started ──> running ──exit──> Crashed ──delay──> spawn
//!                            │
//!                          stop()
//!                            │
//!                 SIGTERM, wait kill_timeout, SIGKILL ──> Stopped
//! ```

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::SupervisorError;

/// How to launch a process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Program name or path.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub kill_timeout: Duration,
    /// Pause before restarting an exited process.
    pub restart_delay: Duration,
}

/// Lifecycle and output events of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A process instance was spawned.
    Started {
        /// OS process id.
        pid: u32,
    },
    /// The process exited because it was stopped.
    Stopped {
        /// Exit code, if it exited normally.
        code: Option<i32>,
    },
    /// The process exited on its own and will be restarted.
    Crashed {
        /// Exit code, if it exited normally.
        code: Option<i32>,
    },
    /// A line written to stdout.
    Stdout(String),
    /// A line written to stderr.
    Stderr(String),
}

/// Handle to a supervised process.
pub struct ProcessSupervisor {
    /// Name used in logs.
    label: String,
    /// Set to true to stop the process for good.
    stop_tx: watch::Sender<bool>,
    /// Supervision loop.
    task: Mutex<Option<JoinHandle<()>>>,
    /// Pid of the live instance, 0 when none.
    pid: Arc<AtomicU32>,
    /// Number of restarts so far.
    restarts: Arc<AtomicU32>,
}

impl ProcessSupervisor {
    /// Start supervising a process.
    ///
    /// # Arguments
    ///
    /// * `label` - Name used in logs.
    /// * `spec` - How to launch the process.
    /// * `events` - Receives lifecycle and output events.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::CommandNotFound`] when the command does not
    /// resolve to an executable. Spawn failures after that are treated like
    /// crashes and retried.
    pub fn start(
        label: impl Into<String>,
        spec: ProcessSpec,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Self, SupervisorError> {
        let label = label.into();
        let program = which::which(&spec.command).map_err(|source| {
            SupervisorError::CommandNotFound {
                command: spec.command.clone(),
                source,
            }
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let pid = Arc::new(AtomicU32::new(0));
        let restarts = Arc::new(AtomicU32::new(0));

        let task = tokio::spawn(supervise(
            label.clone(),
            program,
            spec,
            events,
            stop_rx,
            pid.clone(),
            restarts.clone(),
        ));

        Ok(Self {
            label,
            stop_tx,
            task: Mutex::new(Some(task)),
            pid,
            restarts,
        })
    }

    /// Stop the process and end supervision.
    ///
    /// Sends SIGTERM, waits up to the kill timeout, then kills. Resolves
    /// only after the process has exited.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Supervisor task for {} failed: {}", self.label, e);
        }
    }

    /// Pid of the live process instance.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Number of times the process has been restarted.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Deliver a signal to the live process instance.
    pub fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        match self.pid() {
            Some(pid) => kill(Pid::from_raw(pid as i32), signal).map_err(SupervisorError::SignalFailed),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// Resolve once a stop has been requested or the handle is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_child(program: &Path, spec: &ProcessSpec) -> std::io::Result<Child> {
    let mut command = Command::new(program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    command.spawn()
}

fn forward_lines<R>(reader: R, events: mpsc::UnboundedSender<ProcessEvent>, wrap: fn(String) -> ProcessEvent)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if events.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// Send SIGTERM, wait, then SIGKILL.
async fn terminate(label: &str, child: &mut Child, kill_timeout: Duration) -> Option<i32> {
    if let Some(pid) = child.id()
        && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
    {
        debug!("SIGTERM to {} ({}) failed: {}", label, pid, e);
    }

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!("Failed to wait for {}: {}", label, e);
            None
        }
        Err(_) => {
            warn!("{} did not exit within {:?}, killing", label, kill_timeout);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", label, e);
            }
            None
        }
    }
}

async fn supervise(
    label: String,
    program: PathBuf,
    spec: ProcessSpec,
    events: mpsc::UnboundedSender<ProcessEvent>,
    mut stop_rx: watch::Receiver<bool>,
    pid: Arc<AtomicU32>,
    restarts: Arc<AtomicU32>,
) {
    let mut first = true;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        if !first {
            restarts.fetch_add(1, Ordering::Relaxed);
        }
        first = false;

        let mut child = match spawn_child(&program, &spec) {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", label, e);
                let _ = events.send(ProcessEvent::Crashed { code: None });
                tokio::select! {
                    _ = tokio::time::sleep(spec.restart_delay) => continue,
                    _ = stop_requested(&mut stop_rx) => break,
                }
            }
        };

        let child_pid = child.id().unwrap_or(0);
        pid.store(child_pid, Ordering::Relaxed);
        info!("Started {} (pid {})", label, child_pid);
        let _ = events.send(ProcessEvent::Started { pid: child_pid });

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, events.clone(), ProcessEvent::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, events.clone(), ProcessEvent::Stderr);
        }

        tokio::select! {
            status = child.wait() => {
                pid.store(0, Ordering::Relaxed);
                let code = status.ok().and_then(|s| s.code());
                if *stop_rx.borrow() {
                    let _ = events.send(ProcessEvent::Stopped { code });
                    break;
                }
                warn!("{} exited unexpectedly (code {:?})", label, code);
                let _ = events.send(ProcessEvent::Crashed { code });
            }
            _ = stop_requested(&mut stop_rx) => {
                let code = terminate(&label, &mut child, spec.kill_timeout).await;
                pid.store(0, Ordering::Relaxed);
                info!("Stopped {}", label);
                let _ = events.send(ProcessEvent::Stopped { code });
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(spec.restart_delay) => {}
            _ = stop_requested(&mut stop_rx) => break,
        }
    }
    debug!("Supervision of {} ended", label);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            working_dir: None,
            kill_timeout: Duration::from_millis(500),
            restart_delay: Duration::from_millis(50),
        }
    }

    async fn next_lifecycle(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> ProcessEvent {
        loop {
            match rx.recv().await.unwrap() {
                ProcessEvent::Stdout(_) | ProcessEvent::Stderr(_) => continue,
                event => return event,
            }
        }
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut spec = shell("true");
        spec.command = "definitely-not-a-real-command-xyz".to_string();
        let result = ProcessSupervisor::start("bogus", spec, tx);
        assert!(matches!(result, Err(SupervisorError::CommandNotFound { .. })));
    }

    #[tokio::test]
    async fn test_output_and_env_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spec = shell("echo \"id=$CONNECTION_ID\"; exec sleep 30");
        spec.env.insert("CONNECTION_ID".to_string(), "osc-1".to_string());
        let supervisor = ProcessSupervisor::start("echo", spec, tx).unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ProcessEvent::Started { .. }));
        assert_eq!(rx.recv().await.unwrap(), ProcessEvent::Stdout("id=osc-1".to_string()));
        assert!(supervisor.pid().is_some());

        supervisor.stop().await;
        assert!(matches!(next_lifecycle(&mut rx).await, ProcessEvent::Stopped { .. }));
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_crashed_process_is_restarted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::start("crasher", shell("exit 3"), tx).unwrap();

        assert!(matches!(next_lifecycle(&mut rx).await, ProcessEvent::Started { .. }));
        assert_eq!(next_lifecycle(&mut rx).await, ProcessEvent::Crashed { code: Some(3) });
        assert!(matches!(next_lifecycle(&mut rx).await, ProcessEvent::Started { .. }));
        assert!(supervisor.restart_count() >= 1);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_kills_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spec = shell("trap '' TERM; echo ready; exec sleep 30");
        spec.kill_timeout = Duration::from_millis(200);
        let supervisor = ProcessSupervisor::start("stubborn", spec, tx).unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ProcessEvent::Started { .. }));
        assert_eq!(rx.recv().await.unwrap(), ProcessEvent::Stdout("ready".to_string()));

        let started = std::time::Instant::now();
        supervisor.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(next_lifecycle(&mut rx).await, ProcessEvent::Stopped { code: None });
    }
}
