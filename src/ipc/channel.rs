//! Bidirectional envelope channel over a stream.
//!
//! A channel owns a reader task and a writer task:
//!
//! ```text
//!                 ┌──────────────┐
//!   call() ──────>│ outbound mpsc│──> writer task ──> socket
//!                 └──────────────┘
//!   socket ──> reader task ──┬──> reply?  PendingCalls::resolve
//!                            └──> call/notice  inbound mpsc ──> owner
//! ```
//!
//! Every outbound call waits for its reply for at most the channel's call
//! window. When the peer goes away, calls already in flight are not failed
//! early; they settle as [`IpcError::Timeout`] when their window elapses.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::codec::{read_envelope, write_envelope};
use super::error::{IpcError, IpcResult};
use super::pending::PendingCalls;
use super::protocol::{CorrelationId, Envelope};

/// Capacity of the inbound and outbound queues.
const QUEUE_CAPACITY: usize = 256;

/// One end of an envelope channel.
pub struct IpcChannel {
    /// Envelopes waiting to be written.
    outbound_tx: mpsc::Sender<Envelope>,
    /// Calls awaiting replies.
    pending: Arc<PendingCalls>,
    /// Reply window for outbound calls.
    call_timeout: Duration,
    /// Flips to true once the reader stops.
    closed_rx: watch::Receiver<bool>,
    /// Reader task.
    reader: AbortHandle,
    /// Writer task.
    writer: AbortHandle,
}

impl IpcChannel {
    /// Start the reader and writer tasks for a stream.
    ///
    /// Returns the channel and the receiver of inbound calls and notices.
    /// Replies never appear on the receiver; they are matched to pending
    /// calls by the reader task.
    ///
    /// # Arguments
    ///
    /// * `stream` - Connected stream (usually a `UnixStream`).
    /// * `call_timeout` - Reply window for every outbound call.
    pub fn spawn<S>(stream: S, call_timeout: Duration) -> (Arc<Self>, mpsc::Receiver<Envelope>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending = Arc::new(PendingCalls::new());

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            loop {
                let envelope = match read_envelope(&mut read_half).await {
                    Ok(envelope) => envelope,
                    Err(IpcError::ConnectionClosed) => {
                        debug!("Channel peer closed");
                        break;
                    }
                    Err(e) => {
                        warn!("Channel read error: {}", e);
                        break;
                    }
                };
                trace!("Received '{}' ({:?})", envelope.verb, envelope.correlation_id);

                if envelope.is_reply() {
                    match envelope.correlation_id {
                        Some(id) => {
                            reader_pending.resolve(id, envelope.into_result());
                        }
                        None => debug!("Dropping reply '{}' without correlation id", envelope.verb),
                    }
                    continue;
                }

                if inbound_tx.send(envelope).await.is_err() {
                    debug!("Inbound receiver dropped, stopping reader");
                    break;
                }
            }
            let _ = closed_tx.send(true);
        })
        .abort_handle();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                trace!("Sending '{}' ({:?})", envelope.verb, envelope.correlation_id);
                if let Err(e) = write_envelope(&mut write_half, &envelope).await {
                    if !matches!(e, IpcError::ConnectionClosed) {
                        debug!("Channel write error: {}", e);
                    }
                    break;
                }
            }
        })
        .abort_handle();

        let channel = Arc::new(Self {
            outbound_tx,
            pending,
            call_timeout,
            closed_rx,
            reader,
            writer,
        });
        (channel, inbound_rx)
    }

    /// Send a call and wait for its reply.
    ///
    /// # Errors
    ///
    /// * [`IpcError::Timeout`] when no reply arrives within the call window.
    /// * [`IpcError::Remote`] when the peer replies with an error.
    /// * [`IpcError::ConnectionClosed`] when the channel was already closed.
    pub async fn call<M: Serialize>(&self, message: &M) -> IpcResult<Value> {
        let mut envelope = Envelope::call(0, message)?;
        let verb = envelope.verb.clone();
        let (id, reply_rx) = self.pending.register(&verb);
        envelope.correlation_id = Some(id);

        if self.outbound_tx.send(envelope).await.is_err() {
            self.pending.cancel(id);
            return Err(IpcError::ConnectionClosed);
        }

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(IpcError::Remote { verb, message }),
            Ok(Err(_)) => Err(IpcError::Timeout { verb }),
            Err(_) => {
                self.pending.cancel(id);
                debug!("Call '{}' ({}) timed out after {:?}", verb, id, self.call_timeout);
                Err(IpcError::Timeout { verb })
            }
        }
    }

    /// Send a call and decode its reply.
    pub async fn call_typed<M: Serialize, R: DeserializeOwned>(&self, message: &M) -> IpcResult<R> {
        let verb = Envelope::notice(message)?.verb;
        let value = self.call(message).await?;
        serde_json::from_value(value).map_err(|e| IpcError::Malformed {
            verb,
            message: e.to_string(),
        })
    }

    /// Send a fire-and-forget notice.
    pub async fn notify<M: Serialize>(&self, message: &M) -> IpcResult<()> {
        let envelope = Envelope::notice(message)?;
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Answer an inbound call.
    pub async fn reply(
        &self,
        id: CorrelationId,
        verb: &str,
        result: Result<Value, String>,
    ) -> IpcResult<()> {
        self.outbound_tx
            .send(Envelope::reply(id, verb, result))
            .await
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Forcibly close the channel.
    ///
    /// Stops both tasks, which drops the stream. Outstanding calls still
    /// settle through their own timeouts.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Whether the reader has stopped.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || self.reader.is_finished()
    }

    /// Wait until the reader stops.
    pub async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    /// Number of outbound calls awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Reply window for outbound calls.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{
        ConnectionToHost, Direction, HostToConnection, LogLevel, LogMessage,
    };
    use serde_json::json;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_call_and_reply() {
        let (a, b) = UnixStream::pair().unwrap();
        let (host, _host_inbound) = IpcChannel::spawn(a, Duration::from_secs(5));
        let (peer, mut peer_inbound) = IpcChannel::spawn(b, Duration::from_secs(5));

        let responder = tokio::spawn(async move {
            let call = peer_inbound.recv().await.unwrap();
            assert_eq!(call.verb, "getConfigFields");
            let id = call.correlation_id.unwrap();
            peer.reply(id, &call.verb, Ok(json!([{ "id": "host" }])))
                .await
                .unwrap();
            peer
        });

        let fields = host.call(&HostToConnection::GetConfigFields).await.unwrap();
        assert_eq!(fields, json!([{ "id": "host" }]));
        assert_eq!(host.pending_count(), 0);
        let _peer = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_reported() {
        let (a, b) = UnixStream::pair().unwrap();
        let (host, _host_inbound) = IpcChannel::spawn(a, Duration::from_secs(5));
        let (peer, mut peer_inbound) = IpcChannel::spawn(b, Duration::from_secs(5));

        tokio::spawn(async move {
            let call = peer_inbound.recv().await.unwrap();
            let id = call.correlation_id.unwrap();
            peer.reply(id, &call.verb, Err("unsupported".to_string()))
                .await
                .unwrap();
            peer.closed().await;
        });

        let result = host.call(&HostToConnection::Destroy).await;
        match result {
            Err(IpcError::Remote { verb, message }) => {
                assert_eq!(verb, "destroy");
                assert_eq!(message, "unsupported");
            }
            other => unreachable!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notice_is_delivered_inbound() {
        let (a, b) = UnixStream::pair().unwrap();
        let (host, mut host_inbound) = IpcChannel::spawn(a, Duration::from_secs(5));
        let (peer, _peer_inbound) = IpcChannel::spawn(b, Duration::from_secs(5));

        peer.notify(&ConnectionToHost::LogMessage(LogMessage {
            level: LogLevel::Info,
            message: "hello".to_string(),
        }))
        .await
        .unwrap();

        let envelope = host_inbound.recv().await.unwrap();
        assert_eq!(envelope.direction, Direction::Call);
        assert_eq!(envelope.verb, "log-message");
        assert!(envelope.correlation_id.is_none());
        drop(host);
    }

    #[tokio::test]
    async fn test_peer_drop_settles_call_as_timeout() {
        let (a, b) = UnixStream::pair().unwrap();
        let (host, _host_inbound) = IpcChannel::spawn(a, Duration::from_millis(200));
        let (peer, mut peer_inbound) = IpcChannel::spawn(b, Duration::from_secs(5));

        let crash = tokio::spawn(async move {
            let _call = peer_inbound.recv().await.unwrap();
            drop(peer_inbound);
            drop(peer);
        });

        let result = host.call(&HostToConnection::GetConfigFields).await;
        assert!(matches!(result, Err(IpcError::Timeout { .. })));
        assert_eq!(host.pending_count(), 0);
        crash.await.unwrap();
        host.closed().await;
        assert!(host.is_closed());
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let (a, b) = UnixStream::pair().unwrap();
        let (host, _host_inbound) = IpcChannel::spawn(a, Duration::from_millis(200));
        let (peer, mut peer_inbound) = IpcChannel::spawn(b, Duration::from_secs(5));

        let first = host.call(&HostToConnection::GetConfigFields).await;
        assert!(matches!(first, Err(IpcError::Timeout { .. })));

        let late = peer_inbound.recv().await.unwrap();
        peer.reply(late.correlation_id.unwrap(), &late.verb, Ok(json!("late")))
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            let call = peer_inbound.recv().await.unwrap();
            peer.reply(call.correlation_id.unwrap(), &call.verb, Ok(json!("fresh")))
                .await
                .unwrap();
            peer
        });

        let second = host.call(&HostToConnection::GetConfigFields).await.unwrap();
        assert_eq!(second, json!("fresh"));
        let _peer = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_on_closed_channel() {
        let (a, b) = UnixStream::pair().unwrap();
        let (host, _host_inbound) = IpcChannel::spawn(a, Duration::from_secs(5));
        drop(b);
        host.close();
        tokio::task::yield_now().await;

        let result = host.call(&HostToConnection::Destroy).await;
        assert!(result.is_err());
    }
}
