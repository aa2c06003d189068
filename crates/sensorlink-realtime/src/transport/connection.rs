//! Background WebSocket connection loop with heartbeat and auto-reconnect.
//!
//! The loop is the only writer to the socket. Application sends arrive as
//! [`SocketCommand`]s and are acknowledged once the frame is written.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use sensorlink_common::{RealtimeError, RefCounter};

use super::backoff::Backoff;
use super::envelope::{Envelope, Serializer};
use super::types::{ConnectionState, SocketCommand, SocketConfig, TransportEvent};
use crate::protocol::PHOENIX_TOPIC;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the loop needs that outlives a single session.
pub(crate) struct LoopContext {
    pub(crate) url: String,
    pub(crate) config: SocketConfig,
    pub(crate) refs: RefCounter,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) inbound_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopContext {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(state = %state, "Connection state changed");
            let _ = self.inbound_tx.send(TransportEvent::StateChanged(state));
        }
    }

    fn report(&self, error: RealtimeError, terminal: bool) {
        let _ = self
            .inbound_tx
            .send(TransportEvent::Failed { error, terminal });
    }
}

enum Attempt {
    Opened(Box<WsStream>),
    Failed(RealtimeError),
    Cancelled,
}

enum SessionEnd {
    Lost(RealtimeError),
    Disconnected,
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Runs until `disconnect`, an auth failure, or retry exhaustion.
///
/// `ready` resolves with the outcome of the first connect: `Ok` once a
/// session is open, `Err` if the loop stops before that.
pub(crate) async fn connection_loop(
    ctx: LoopContext,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    ready: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::new(
        ctx.config.reconnect_base,
        ctx.config.reconnect_max,
        ctx.config.jitter,
    );
    let mut failures: u32 = 0;

    ctx.set_state(ConnectionState::Connecting);

    let stop_error = loop {
        info!(url = %redacted(&ctx.url), "Connecting to Phoenix socket");

        match connect_or_cancel(&ctx, &mut cmd_rx).await {
            Attempt::Opened(ws) => {
                backoff.reset();
                failures = 0;
                ctx.set_state(ConnectionState::Connected);
                info!("Phoenix socket connected");
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }

                match run_session(&ctx, *ws, &mut cmd_rx).await {
                    SessionEnd::Disconnected => break None,
                    SessionEnd::Lost(e) => {
                        warn!(error = %e, "Phoenix socket lost");
                        ctx.report(e, false);
                        ctx.set_state(ConnectionState::Reconnecting);
                    }
                }
            }
            Attempt::Failed(e @ RealtimeError::Auth(_)) => {
                error!(error = %e, "Phoenix socket rejected credentials");
                break Some(e);
            }
            Attempt::Failed(e) => {
                failures += 1;
                if ctx.config.max_retries.is_some_and(|max| failures >= max) {
                    error!(error = %e, failures, "Giving up on Phoenix socket");
                    break Some(RealtimeError::RetriesExhausted(failures));
                }
                warn!(error = %e, failures, "Failed to connect to Phoenix socket");
                ctx.report(e, false);
                ctx.set_state(ConnectionState::Reconnecting);
            }
            Attempt::Cancelled => break Some(RealtimeError::Cancelled),
        }

        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        if !sleep_or_cancel(delay, &mut cmd_rx).await {
            break Some(RealtimeError::Cancelled);
        }
    };

    if let Some(e) = &stop_error {
        if !matches!(e, RealtimeError::Cancelled) {
            ctx.report(e.clone(), true);
        }
    }
    ctx.set_state(ConnectionState::Disconnected);
    if let (Some(e), Some(tx)) = (stop_error, ready.take()) {
        let _ = tx.send(Err(e));
    }
    info!("Phoenix connection loop stopped");
}

/// One handshake attempt. Sends issued meanwhile fail with `NotConnected`.
async fn connect_or_cancel(
    ctx: &LoopContext,
    cmd_rx: &mut mpsc::Receiver<SocketCommand>,
) -> Attempt {
    let open = open_socket(&ctx.url, ctx.config.connect_timeout);
    tokio::pin!(open);
    loop {
        tokio::select! {
            result = &mut open => {
                return match result {
                    Ok(ws) => Attempt::Opened(Box::new(ws)),
                    Err(e) => Attempt::Failed(e),
                };
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send { ack, .. }) => {
                    let _ = ack.send(Err(RealtimeError::NotConnected));
                }
                Some(SocketCommand::Disconnect) | None => return Attempt::Cancelled,
            }
        }
    }
}

/// Returns `false` when the wait was cut short by `disconnect`.
async fn sleep_or_cancel(delay: Duration, cmd_rx: &mut mpsc::Receiver<SocketCommand>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send { ack, .. }) => {
                    let _ = ack.send(Err(RealtimeError::NotConnected));
                }
                Some(SocketCommand::Disconnect) | None => return false,
            }
        }
    }
}

async fn open_socket(url: &str, timeout: Duration) -> Result<WsStream, RealtimeError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(tungstenite::Error::Http(response))) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                Err(RealtimeError::Auth(format!(
                    "handshake rejected with HTTP {status}"
                )))
            } else {
                Err(RealtimeError::Connection(format!(
                    "handshake failed with HTTP {status}"
                )))
            }
        }
        Ok(Err(e)) => Err(RealtimeError::Connection(e.to_string())),
        Err(_elapsed) => Err(RealtimeError::Connection(format!(
            "connect timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

async fn run_session(
    ctx: &LoopContext,
    ws: WsStream,
    cmd_rx: &mut mpsc::Receiver<SocketCommand>,
) -> SessionEnd {
    let serializer = ctx.config.serializer;
    let (mut write, mut read) = ws.split();

    let interval = ctx.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Deadline of the oldest unanswered heartbeat.
    let mut heartbeat_deadline: Option<Instant> = None;
    let mut decode_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let envelope = Envelope::heartbeat(ctx.refs.next());
                if let Err(e) = write_envelope(&mut write, serializer, &envelope).await {
                    return SessionEnd::Lost(e);
                }
                debug!(msg_ref = ?envelope.msg_ref, "Heartbeat sent");
                if heartbeat_deadline.is_none() {
                    heartbeat_deadline = Some(Instant::now() + ctx.config.heartbeat_timeout);
                }
            }

            _ = wait_for_deadline(heartbeat_deadline) => {
                return SessionEnd::Lost(RealtimeError::Connection(format!(
                    "no heartbeat reply within {}ms",
                    ctx.config.heartbeat_timeout.as_millis()
                )));
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send { envelope, ack }) => {
                    let result = write_envelope(&mut write, serializer, &envelope).await;
                    let lost = result.as_ref().err().cloned();
                    let _ = ack.send(result);
                    if let Some(e) = lost {
                        return SessionEnd::Lost(e);
                    }
                }
                Some(SocketCommand::Disconnect) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    let _ = write.close().await;
                    return SessionEnd::Disconnected;
                }
            },

            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serializer.decode(text.as_str()) {
                    Ok(envelope) => {
                        decode_errors = 0;
                        if envelope.topic == PHOENIX_TOPIC {
                            if envelope.is_reply() {
                                heartbeat_deadline = None;
                            }
                            continue;
                        }
                        let _ = ctx.inbound_tx.send(TransportEvent::Message(envelope));
                    }
                    Err(e) => {
                        decode_errors += 1;
                        warn!(error = %e, decode_errors, "Dropping undecodable frame");
                        if decode_errors >= ctx.config.max_decode_errors {
                            return SessionEnd::Lost(RealtimeError::Decode(format!(
                                "{decode_errors} consecutive undecodable frames"
                            )));
                        }
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(frame = ?frame, "Server closed Phoenix socket");
                    return SessionEnd::Lost(RealtimeError::Connection("closed by server".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(RealtimeError::Connection(e.to_string())),
                None => {
                    return SessionEnd::Lost(RealtimeError::Connection("stream ended".into()));
                }
            },
        }
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn write_envelope<S>(
    write: &mut S,
    serializer: Serializer,
    envelope: &Envelope,
) -> Result<(), RealtimeError>
where
    S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let json = serializer.encode(envelope)?;
    write
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| RealtimeError::Connection(format!("write failed: {e}")))
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Socket endpoint with the serializer version and token query parameters,
/// percent-encoded.
pub(crate) fn endpoint_url(base: &str, token: Option<&str>, vsn: &str) -> Result<String, RealtimeError> {
    let mut url = Url::parse(base)
        .map_err(|e| RealtimeError::Connection(format!("invalid endpoint {base}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("vsn", vsn);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url.into())
}

/// The URL without its query string, safe to log.
pub(crate) fn redacted(url: &str) -> &str {
    url.split('?').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_vsn_and_token() {
        assert_eq!(
            endpoint_url("ws://localhost:4000/socket/websocket", Some("abc"), "2.0.0").unwrap(),
            "ws://localhost:4000/socket/websocket?vsn=2.0.0&token=abc"
        );
        assert_eq!(
            endpoint_url("ws://h/socket/websocket?tenant=1", None, "1.0.0").unwrap(),
            "ws://h/socket/websocket?tenant=1&vsn=1.0.0"
        );
    }

    #[test]
    fn token_reserved_characters_are_encoded() {
        let url = endpoint_url("ws://h/socket/websocket", Some("a+b/c&admin=1"), "2.0.0").unwrap();
        assert_eq!(url, "ws://h/socket/websocket?vsn=2.0.0&token=a%2Bb%2Fc%26admin%3D1");

        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("vsn".to_string(), "2.0.0".to_string()),
                ("token".to_string(), "a+b/c&admin=1".to_string()),
            ]
        );
    }

    #[test]
    fn invalid_endpoint_is_a_connection_error() {
        let err = endpoint_url("not a url", Some("t"), "2.0.0").unwrap_err();
        assert!(matches!(err, RealtimeError::Connection(_)));
    }

    #[test]
    fn redaction_strips_query() {
        let url = endpoint_url("wss://h/socket/websocket", Some("secret"), "2.0.0").unwrap();
        assert_eq!(redacted(&url), "wss://h/socket/websocket");
        assert!(!redacted(&url).contains("secret"));
    }

    #[tokio::test]
    async fn set_state_reports_changes_only() {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let ctx = LoopContext {
            url: String::new(),
            config: SocketConfig::default(),
            refs: RefCounter::new(),
            state_tx,
            inbound_tx,
        };

        ctx.set_state(ConnectionState::Connecting);
        ctx.set_state(ConnectionState::Connecting);
        ctx.set_state(ConnectionState::Connected);
        drop(ctx);

        let mut seen = Vec::new();
        while let Some(event) = inbound_rx.recv().await {
            if let TransportEvent::StateChanged(s) = event {
                seen.push(s);
            }
        }
        assert_eq!(
            seen,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connection_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let err = open_socket("ws://127.0.0.1:9/socket/websocket", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Connection(_)));
    }
}
