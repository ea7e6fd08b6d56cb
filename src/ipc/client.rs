//! Connection-side end of the channel.
//!
//! Integration processes are started with their identity in the
//! environment. [`ConnectionClient::connect`] dials the host, performs the
//! `register` handshake and then exposes the channel for host calls.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::info;

use super::channel::IpcChannel;
use super::error::{IpcError, IpcResult};
use super::protocol::{ConnectionToHost, CorrelationId, Envelope, RegisterRequest};

/// Environment variable carrying the connection id.
pub const ENV_CONNECTION_ID: &str = "CONNECTION_ID";
/// Environment variable carrying the channel socket path.
pub const ENV_CHANNEL_ADDRESS: &str = "CHANNEL_ADDRESS";
/// Environment variable carrying the registration token.
pub const ENV_CHANNEL_TOKEN: &str = "CHANNEL_TOKEN";
/// Environment variable carrying the integration entry point.
pub const ENV_ENTRY_POINT: &str = "ENTRY_POINT";
/// Environment variable carrying the integration manifest path.
pub const ENV_MANIFEST_PATH: &str = "MANIFEST_PATH";

/// Identity handed to a connection process.
#[derive(Debug, Clone)]
pub struct ConnectionEnv {
    /// Connection id to claim.
    pub connection_id: String,
    /// Socket to dial.
    pub channel_address: PathBuf,
    /// Registration token.
    pub token: String,
    /// Entry point, if the host provided one.
    pub entry_point: Option<PathBuf>,
    /// Manifest path, if the host provided one.
    pub manifest_path: Option<PathBuf>,
}

impl ConnectionEnv {
    /// Read the identity from the process environment.
    pub fn from_env() -> IpcResult<Self> {
        let require = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(IpcError::MissingEnv(name))
        };
        Ok(Self {
            connection_id: require(ENV_CONNECTION_ID)?,
            channel_address: PathBuf::from(require(ENV_CHANNEL_ADDRESS)?),
            token: require(ENV_CHANNEL_TOKEN)?,
            entry_point: std::env::var_os(ENV_ENTRY_POINT).map(PathBuf::from),
            manifest_path: std::env::var_os(ENV_MANIFEST_PATH).map(PathBuf::from),
        })
    }
}

/// A registered connection-side channel.
pub struct ConnectionClient {
    /// Underlying channel.
    channel: Arc<IpcChannel>,
    /// Calls and notices from the host.
    inbound: mpsc::Receiver<Envelope>,
    /// Claimed connection id.
    connection_id: String,
}

impl ConnectionClient {
    /// Dial the host and register.
    ///
    /// # Arguments
    ///
    /// * `env` - Identity to claim.
    /// * `api_version` - Protocol version this process speaks.
    /// * `call_timeout` - Reply window for calls to the host.
    pub async fn connect(
        env: &ConnectionEnv,
        api_version: &str,
        call_timeout: Duration,
    ) -> IpcResult<Self> {
        let stream = UnixStream::connect(&env.channel_address).await?;
        let (channel, inbound) = IpcChannel::spawn(stream, call_timeout);

        channel
            .call(&ConnectionToHost::Register(RegisterRequest {
                api_version: api_version.to_string(),
                connection_id: env.connection_id.clone(),
                token: env.token.clone(),
            }))
            .await?;
        info!("Registered as connection {}", env.connection_id);

        Ok(Self {
            channel,
            inbound,
            connection_id: env.connection_id.clone(),
        })
    }

    /// Connection id this client registered as.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Next call or notice from the host; `None` once the host hangs up.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Send a fire-and-forget message to the host.
    pub async fn send(&self, message: &ConnectionToHost) -> IpcResult<()> {
        self.channel.notify(message).await
    }

    /// Send a call to the host and wait for the reply.
    pub async fn call(&self, message: &ConnectionToHost) -> IpcResult<Value> {
        self.channel.call(message).await
    }

    /// Answer a host call.
    pub async fn reply(
        &self,
        id: CorrelationId,
        verb: &str,
        result: Result<Value, String>,
    ) -> IpcResult<()> {
        self.channel.reply(id, verb, result).await
    }

    /// Shared handle to the channel.
    pub fn channel(&self) -> Arc<IpcChannel> {
        self.channel.clone()
    }
}
