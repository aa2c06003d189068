//! Public handle for the multiplexed Phoenix connection.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sensorlink_common::{RealtimeError, RefCounter};

use super::connection::{connection_loop, endpoint_url, LoopContext};
use super::envelope::Envelope;
use super::types::{ConnectionState, SocketCommand, SocketConfig, TransportEvent};

/// How long `disconnect` waits for the loop to close the socket cleanly.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// What a [`Channel`](crate::Channel) needs from the connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next connection-wide message ref.
    fn next_ref(&self) -> String;

    /// Write one envelope. Resolves once the frame is on the wire.
    async fn send(&self, envelope: Envelope) -> Result<(), RealtimeError>;
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// Handle for the WebSocket connection. Cheap to clone.
///
/// The connection itself lives in a background task started by
/// [`Socket::connect`]; every clone talks to the same task.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    config: SocketConfig,
    refs: RefCounter,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    command_tx: Mutex<Option<mpsc::Sender<SocketCommand>>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Socket {
    /// Create an idle socket. Returns `(socket, inbound_events)`.
    pub fn new(config: SocketConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let socket = Self {
            inner: Arc::new(SocketInner {
                config,
                refs: RefCounter::new(),
                state_tx,
                inbound_tx,
                command_tx: Mutex::new(None),
                task: StdMutex::new(None),
            }),
        };
        (socket, inbound_rx)
    }

    /// Start the connection task and wait for the first outcome.
    ///
    /// Network failures are retried with backoff before this resolves; only
    /// an auth rejection, retry exhaustion, or a concurrent `disconnect`
    /// produce an error. Calling it while already running is a no-op.
    pub async fn connect(&self, url: &str, auth_token: Option<&str>) -> Result<(), RealtimeError> {
        let endpoint = endpoint_url(url, auth_token, self.inner.config.serializer.vsn())?;
        let ready_rx = {
            let mut command_tx = self.inner.command_tx.lock().await;
            if command_tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
                debug!("connect called on a running socket");
                return Ok(());
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(256);
            let (ready_tx, ready_rx) = oneshot::channel();
            let ctx = LoopContext {
                url: endpoint,
                config: self.inner.config.clone(),
                refs: self.inner.refs.clone(),
                state_tx: self.inner.state_tx.clone(),
                inbound_tx: self.inner.inbound_tx.clone(),
            };
            let handle = tokio::spawn(connection_loop(ctx, cmd_rx, ready_tx));
            *command_tx = Some(cmd_tx);
            if let Ok(mut task) = self.inner.task.lock() {
                if let Some(old) = task.replace(handle) {
                    old.abort();
                }
            }
            ready_rx
        };

        ready_rx.await.unwrap_or(Err(RealtimeError::Cancelled))
    }

    /// Write an envelope. Fails with `NotConnected` unless Connected.
    pub async fn send(&self, envelope: Envelope) -> Result<(), RealtimeError> {
        if self.state() != ConnectionState::Connected {
            return Err(RealtimeError::NotConnected);
        }
        let tx = self
            .inner
            .command_tx
            .lock()
            .await
            .clone()
            .ok_or(RealtimeError::NotConnected)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(SocketCommand::Send {
            envelope,
            ack: ack_tx,
        })
        .await
        .map_err(|_| RealtimeError::NotConnected)?;
        ack_rx.await.unwrap_or(Err(RealtimeError::NotConnected))
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        let Some(tx) = self.inner.command_tx.lock().await.take() else {
            return;
        };
        let _ = tx.send(SocketCommand::Disconnect).await;

        let handle = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut handle) = handle {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                warn!("Connection task did not stop in time, aborting");
                handle.abort();
            }
        }
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
    }

    pub fn next_ref(&self) -> String {
        self.inner.refs.next()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }
}

#[async_trait]
impl Transport for Socket {
    fn next_ref(&self) -> String {
        Socket::next_ref(self)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), RealtimeError> {
        Socket::send(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let (socket, _rx) = Socket::new(SocketConfig::default());
        let err = socket
            .send(Envelope::new("room:1", "ping", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::NotConnected));
        assert_eq!(socket.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refs_are_shared_between_clones() {
        let (socket, _rx) = Socket::new(SocketConfig::default());
        let other = socket.clone();
        assert_eq!(socket.next_ref(), "1");
        assert_eq!(other.next_ref(), "2");
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_no_op() {
        let (socket, _rx) = Socket::new(SocketConfig::default());
        socket.disconnect().await;
        assert_eq!(socket.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn retries_exhausted_is_terminal() {
        let config = SocketConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(20),
            jitter: false,
            max_retries: Some(2),
            connect_timeout: Duration::from_secs(2),
            ..SocketConfig::default()
        };
        let (socket, mut rx) = Socket::new(config);
        let err = socket
            .connect("ws://127.0.0.1:9/socket/websocket", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::RetriesExhausted(2)));

        let mut saw_terminal = false;
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Failed { terminal: true, .. } = event {
                saw_terminal = true;
            }
        }
        assert!(saw_terminal);
    }
}
