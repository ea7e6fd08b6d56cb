//! Unix socket listener accepting connection channels.
//!
//! Every accepted stream becomes an [`IpcChannel`]. The first envelope on a
//! fresh channel must be a `register` call; anything else, or silence for
//! longer than the registration window, closes the channel. Well-formed
//! registrations are handed to the host as [`RegistrationAttempt`]s for the
//! version, id and token checks.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::channel::IpcChannel;
use super::error::IpcResult;
use super::protocol::{ConnectionToHost, CorrelationId, Envelope, REGISTER_VERB, RegisterRequest};

/// A channel whose first message was a well-formed `register` call.
pub struct RegistrationAttempt {
    /// The new channel.
    pub channel: Arc<IpcChannel>,
    /// Inbound calls and notices following the registration.
    pub inbound: mpsc::Receiver<Envelope>,
    /// Correlation id of the `register` call, for the ack.
    pub correlation_id: CorrelationId,
    /// Claimed identity.
    pub request: RegisterRequest,
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Socket path.
    pub socket_path: PathBuf,
    /// Reply window for calls on accepted channels.
    pub call_timeout: Duration,
    /// How long a fresh channel may stay silent before registering.
    pub register_timeout: Duration,
}

/// Accepts connection processes on a Unix socket.
pub struct ChannelListener {
    /// Bound listener.
    listener: UnixListener,
    /// Settings.
    config: ListenerConfig,
}

impl ChannelListener {
    /// Bind the socket.
    ///
    /// Creates the parent directory, removes a stale socket file and
    /// restricts the new socket to the current user.
    pub fn bind(config: ListenerConfig) -> IpcResult<Self> {
        if let Some(parent) = config.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if config.socket_path.exists() {
            fs::remove_file(&config.socket_path)?;
        }

        let listener = UnixListener::bind(&config.socket_path)?;
        fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600))?;
        info!("Connection channel listening on {:?}", config.socket_path);

        Ok(Self { listener, config })
    }

    /// Socket path connections should dial.
    pub fn path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept channels until shutdown.
    ///
    /// # Arguments
    ///
    /// * `attempts` - Receives every well-formed registration.
    /// * `shutdown_rx` - Stops the loop when it flips to true.
    pub async fn run(
        self,
        attempts: mpsc::Sender<RegistrationAttempt>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            debug!("Accepted connection channel");
                            self.spawn_handshake(stream, attempts.clone());
                        }
                        Err(e) => {
                            warn!("Failed to accept connection channel: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Connection channel listener shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = fs::remove_file(&self.config.socket_path) {
            warn!("Failed to remove socket file: {}", e);
        }
    }

    /// Wait for the first envelope on a new stream and forward it.
    fn spawn_handshake(&self, stream: UnixStream, attempts: mpsc::Sender<RegistrationAttempt>) {
        let call_timeout = self.config.call_timeout;
        let register_timeout = self.config.register_timeout;

        tokio::spawn(async move {
            let (channel, mut inbound) = IpcChannel::spawn(stream, call_timeout);

            let first = match tokio::time::timeout(register_timeout, inbound.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("Channel closed before registering");
                    return;
                }
                Err(_) => {
                    warn!("Channel did not register within {:?}, closing", register_timeout);
                    channel.close();
                    return;
                }
            };

            let attempt = match parse_register(&first) {
                Some((correlation_id, request)) => RegistrationAttempt {
                    channel,
                    inbound,
                    correlation_id,
                    request,
                },
                None => {
                    warn!("First message on channel was '{}', not a registration; closing", first.verb);
                    channel.close();
                    return;
                }
            };

            if let Err(e) = attempts.send(attempt).await {
                debug!("Host no longer accepting registrations");
                e.0.channel.close();
            }
        });
    }
}

/// Extract a registration from the first envelope of a channel.
fn parse_register(envelope: &Envelope) -> Option<(CorrelationId, RegisterRequest)> {
    if envelope.verb != REGISTER_VERB || !envelope.expects_reply() {
        return None;
    }
    let correlation_id = envelope.correlation_id?;
    match envelope.decode::<ConnectionToHost>() {
        Ok(ConnectionToHost::Register(request)) => Some((correlation_id, request)),
        Ok(_) => None,
        Err(e) => {
            debug!("Malformed registration: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{HostToConnection, LogLevel, LogMessage};
    use tempfile::tempdir;

    fn config(dir: &Path) -> ListenerConfig {
        ListenerConfig {
            socket_path: dir.join("sock").join("connections.sock"),
            call_timeout: Duration::from_secs(1),
            register_timeout: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_parse_register_requires_call() {
        let request = ConnectionToHost::Register(RegisterRequest {
            api_version: "1.0.0".to_string(),
            connection_id: "osc-1".to_string(),
            token: "t".to_string(),
        });
        let call = Envelope::call(5, &request).unwrap();
        let (id, parsed) = parse_register(&call).unwrap();
        assert_eq!(id, 5);
        assert_eq!(parsed.connection_id, "osc-1");

        let notice = Envelope::notice(&request).unwrap();
        assert!(parse_register(&notice).is_none());

        let other = Envelope::call(6, &HostToConnection::Destroy).unwrap();
        assert!(parse_register(&other).is_none());
    }

    #[tokio::test]
    async fn test_registration_is_forwarded() {
        let dir = tempdir().unwrap();
        let listener = ChannelListener::bind(config(dir.path())).unwrap();
        let path = listener.path().to_path_buf();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let (attempt_tx, mut attempt_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(listener.run(attempt_tx, shutdown_rx));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (client, _client_inbound) = IpcChannel::spawn(stream, Duration::from_secs(1));
        let register = tokio::spawn(async move {
            client
                .call(&ConnectionToHost::Register(RegisterRequest {
                    api_version: "1.2.0".to_string(),
                    connection_id: "osc-1".to_string(),
                    token: "secret".to_string(),
                }))
                .await
        });

        let attempt = attempt_rx.recv().await.unwrap();
        assert_eq!(attempt.request.connection_id, "osc-1");
        assert_eq!(attempt.request.token, "secret");
        attempt
            .channel
            .reply(attempt.correlation_id, REGISTER_VERB, Ok(serde_json::Value::Null))
            .await
            .unwrap();
        assert!(register.await.unwrap().is_ok());

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_non_register_first_message_closes_channel() {
        let dir = tempdir().unwrap();
        let listener = ChannelListener::bind(config(dir.path())).unwrap();
        let path = listener.path().to_path_buf();

        let (attempt_tx, mut attempt_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.run(attempt_tx, shutdown_rx));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (client, _client_inbound) = IpcChannel::spawn(stream, Duration::from_secs(1));
        client
            .notify(&ConnectionToHost::LogMessage(LogMessage {
                level: LogLevel::Info,
                message: "too early".to_string(),
            }))
            .await
            .unwrap();

        client.closed().await;
        assert!(attempt_rx.try_recv().is_err());
    }
}
