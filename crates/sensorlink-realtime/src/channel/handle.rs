//! Per-topic channel: join/leave lifecycle and reply correlation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sensorlink_common::RealtimeError;

use super::types::{ChannelSignal, ChannelState, JoinedReply, Reply, Subscription};
use crate::protocol::events;
use crate::transport::{Envelope, Transport};

type ReplyTx = oneshot::Sender<Result<Reply, RealtimeError>>;

struct PendingEntry {
    /// Join generation the request was sent under.
    join_ref: Option<String>,
    event: String,
    tx: ReplyTx,
}

struct ChannelInner {
    state: ChannelState,
    join_ref: Option<String>,
    params: Value,
    pending: HashMap<String, PendingEntry>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>,
    next_subscription: u64,
}

struct ChannelShared {
    topic: String,
    transport: Arc<dyn Transport>,
    push_timeout: Duration,
    inner: Mutex<ChannelInner>,
}

/// Handle to one topic on the shared connection. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.shared.topic)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub fn new(topic: impl Into<String>, transport: Arc<dyn Transport>, push_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                topic: topic.into(),
                transport,
                push_timeout,
                inner: Mutex::new(ChannelInner {
                    state: ChannelState::Closed,
                    join_ref: None,
                    params: Value::Object(Default::default()),
                    pending: HashMap::new(),
                    subscribers: HashMap::new(),
                    next_subscription: 1,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn join_ref(&self) -> Option<String> {
        self.lock().join_ref.clone()
    }

    /// Params of the most recent join.
    pub fn params(&self) -> Value {
        self.lock().params.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    // -----------------------------------------------------------------------
    // Join / leave
    // -----------------------------------------------------------------------

    /// Join under a fresh join ref. Replies to the previous generation are
    /// ignored from here on.
    pub async fn join(&self, params: Value, timeout: Duration) -> Result<JoinedReply, RealtimeError> {
        let join_ref = self.shared.transport.next_ref();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            inner.state = ChannelState::Joining;
            inner.join_ref = Some(join_ref.clone());
            inner.params = params.clone();
            inner.pending.insert(
                join_ref.clone(),
                PendingEntry {
                    join_ref: Some(join_ref.clone()),
                    event: events::PHX_JOIN.into(),
                    tx,
                },
            );
        }
        debug!(topic = %self.topic(), join_ref = %join_ref, "Joining channel");

        let envelope = Envelope::new(self.topic(), events::PHX_JOIN, params)
            .with_refs(Some(join_ref.clone()), Some(join_ref.clone()));
        if let Err(e) = self.shared.transport.send(envelope).await {
            self.abandon_join(&join_ref);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RealtimeError::Cancelled),
            Err(_) => {
                warn!(topic = %self.topic(), "Join timed out");
                self.abandon_join(&join_ref);
                Err(RealtimeError::JoinTimeout {
                    topic: self.topic().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Only reverts state if no newer join has started since.
    fn abandon_join(&self, join_ref: &str) {
        let mut inner = self.lock();
        inner.pending.remove(join_ref);
        if inner.join_ref.as_deref() == Some(join_ref) && inner.state == ChannelState::Joining {
            inner.state = ChannelState::Closed;
        }
    }

    /// Leave the topic. Always ends Closed locally, whether or not the
    /// server acknowledges within `timeout`.
    pub async fn leave(&self, timeout: Duration) {
        let (join_ref, was_open) = {
            let mut inner = self.lock();
            let was_open = matches!(inner.state, ChannelState::Joined | ChannelState::Joining);
            inner.state = ChannelState::Leaving;
            reject_all(&mut inner, || RealtimeError::ChannelClosed(self.topic().to_string()));
            (inner.join_ref.clone(), was_open)
        };

        if was_open {
            let msg_ref = self.shared.transport.next_ref();
            let (tx, rx) = oneshot::channel();
            self.lock().pending.insert(
                msg_ref.clone(),
                PendingEntry {
                    join_ref: join_ref.clone(),
                    event: events::PHX_LEAVE.into(),
                    tx,
                },
            );
            let envelope = Envelope::new(self.topic(), events::PHX_LEAVE, Value::Object(Default::default()))
                .with_refs(join_ref, Some(msg_ref.clone()));
            match self.shared.transport.send(envelope).await {
                Ok(()) => {
                    if tokio::time::timeout(timeout, rx).await.is_err() {
                        debug!(topic = %self.topic(), "No reply to phx_leave");
                    }
                }
                Err(e) => debug!(topic = %self.topic(), error = %e, "phx_leave not sent"),
            }
        }

        let mut inner = self.lock();
        inner.state = ChannelState::Closed;
        inner.join_ref = None;
        reject_all(&mut inner, || RealtimeError::ChannelClosed(self.topic().to_string()));
        info!(topic = %self.topic(), "Left channel");
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Push with the channel's default timeout.
    pub async fn push(&self, event: &str, payload: Value) -> Result<PendingReply, RealtimeError> {
        self.push_with_timeout(event, payload, self.shared.push_timeout).await
    }

    pub async fn push_with_timeout(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, RealtimeError> {
        let msg_ref = self.shared.transport.next_ref();
        let (tx, rx) = oneshot::channel();
        let join_ref = {
            let mut inner = self.lock();
            if inner.state != ChannelState::Joined {
                return Err(RealtimeError::ChannelNotJoined(self.topic().to_string()));
            }
            let join_ref = inner.join_ref.clone();
            inner.pending.insert(
                msg_ref.clone(),
                PendingEntry {
                    join_ref: join_ref.clone(),
                    event: event.to_string(),
                    tx,
                },
            );
            join_ref
        };

        // Dropping this on a failed send evicts the entry.
        let pending = PendingReply {
            channel: self.clone(),
            msg_ref: msg_ref.clone(),
            event: event.to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            rx: Some(rx),
        };

        let envelope = Envelope::new(self.topic(), event, payload).with_refs(join_ref, Some(msg_ref));
        self.shared.transport.send(envelope).await?;
        Ok(pending)
    }

    /// Push and wait for the reply.
    pub async fn push_and_wait(&self, event: &str, payload: Value) -> Result<Reply, RealtimeError> {
        self.push(event, payload).await?.wait().await
    }

    fn evict(&self, msg_ref: &str) {
        self.lock().pending.remove(msg_ref);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Receive every server-pushed `event` on this topic.
    pub fn on(&self, event: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner
            .subscribers
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        Subscription {
            id,
            event: event.to_string(),
            rx,
        }
    }

    /// Remove a subscription. Its receiver then drains and ends.
    pub fn off(&self, subscription_id: u64) {
        let mut inner = self.lock();
        for subs in inner.subscribers.values_mut() {
            subs.retain(|(id, _)| *id != subscription_id);
        }
        inner.subscribers.retain(|_, subs| !subs.is_empty());
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Route one inbound envelope for this topic.
    pub fn handle_message(&self, envelope: &Envelope) -> ChannelSignal {
        let mut inner = self.lock();

        if envelope.join_ref.is_some() && envelope.join_ref != inner.join_ref {
            debug!(
                topic = %self.topic(),
                event = %envelope.event,
                join_ref = ?envelope.join_ref,
                "Dropping message from stale join"
            );
            return ChannelSignal::Ignored;
        }

        match envelope.event.as_str() {
            events::PHX_REPLY => self.handle_reply(&mut inner, envelope),
            events::PHX_ERROR => {
                if !matches!(inner.state, ChannelState::Joined | ChannelState::Joining) {
                    return ChannelSignal::Ignored;
                }
                let reason = reason_from(&envelope.payload, "channel crashed");
                warn!(topic = %self.topic(), reason = %reason, "Channel errored");
                inner.state = ChannelState::Errored;
                if let Some(entry) = inner.join_ref.clone().and_then(|r| inner.pending.remove(&r)) {
                    let _ = entry.tx.send(Err(RealtimeError::JoinRejected {
                        topic: self.topic().to_string(),
                        reason: reason.clone(),
                    }));
                }
                ChannelSignal::Errored { reason }
            }
            events::PHX_CLOSE => {
                info!(topic = %self.topic(), "Channel closed by server");
                inner.state = ChannelState::Closed;
                reject_all(&mut inner, || RealtimeError::ChannelClosed(self.topic().to_string()));
                ChannelSignal::Closed
            }
            event => {
                if let Some(subs) = inner.subscribers.get_mut(event) {
                    subs.retain(|(_, tx)| tx.send(envelope.payload.clone()).is_ok());
                }
                ChannelSignal::Event(envelope.clone())
            }
        }
    }

    fn handle_reply(&self, inner: &mut ChannelInner, envelope: &Envelope) -> ChannelSignal {
        let Some(msg_ref) = envelope.msg_ref.as_deref() else {
            return ChannelSignal::Ignored;
        };
        let Some(entry) = inner.pending.remove(msg_ref) else {
            debug!(topic = %self.topic(), msg_ref, "Reply with no pending request");
            return ChannelSignal::Ignored;
        };
        if entry.join_ref != inner.join_ref {
            debug!(topic = %self.topic(), msg_ref, "Discarding reply from previous join");
            inner.pending.insert(msg_ref.to_string(), entry);
            return ChannelSignal::Ignored;
        }

        let status = envelope.reply_status().unwrap_or("error").to_string();
        let response = envelope.reply_response();
        let is_join = entry.event == events::PHX_JOIN;

        if status == "ok" {
            let reply = Reply { status, response };
            let _ = entry.tx.send(Ok(reply.clone()));
            if is_join {
                inner.state = ChannelState::Joined;
                info!(topic = %self.topic(), "Joined channel");
                return ChannelSignal::Joined(reply);
            }
            return ChannelSignal::Replied;
        }

        if is_join {
            let reason = reason_from(&response, &status);
            warn!(topic = %self.topic(), reason = %reason, "Join rejected");
            inner.state = ChannelState::Errored;
            let _ = entry.tx.send(Err(RealtimeError::JoinRejected {
                topic: self.topic().to_string(),
                reason: reason.clone(),
            }));
            return ChannelSignal::Errored { reason };
        }

        let _ = entry.tx.send(Err(RealtimeError::PushRejected {
            topic: self.topic().to_string(),
            event: entry.event,
            response,
        }));
        ChannelSignal::Replied
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// The socket went away. Pending requests stay until their own timeouts.
    pub fn reset_on_disconnect(&self) {
        let mut inner = self.lock();
        if inner.state != ChannelState::Closed {
            debug!(topic = %self.topic(), state = %inner.state, "Transport lost, channel closed");
            inner.state = ChannelState::Closed;
        }
    }

    /// Fail every pending request with `error`.
    pub fn cancel_pending(&self, error: RealtimeError) {
        let mut inner = self.lock();
        reject_all(&mut inner, || error.clone());
    }
}

fn reject_all(inner: &mut ChannelInner, error: impl Fn() -> RealtimeError) {
    for (_, entry) in inner.pending.drain() {
        let _ = entry.tx.send(Err(error()));
    }
}

fn reason_from(response: &Value, fallback: &str) -> String {
    match response.get("reason") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None if response.is_null() || response.as_object().is_some_and(|o| o.is_empty()) => {
            fallback.to_string()
        }
        None => response.to_string(),
    }
}

// ---------------------------------------------------------------------------
// PendingReply
// ---------------------------------------------------------------------------

/// An in-flight push. Dropping it without waiting evicts the pending entry.
pub struct PendingReply {
    channel: Channel,
    msg_ref: String,
    event: String,
    timeout: Duration,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Result<Reply, RealtimeError>>>,
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("topic", &self.channel.topic())
            .field("msg_ref", &self.msg_ref)
            .field("event", &self.event)
            .finish()
    }
}

impl PendingReply {
    pub fn msg_ref(&self) -> &str {
        &self.msg_ref
    }

    /// Resolve with the matching reply, or `PushTimeout` once the push's
    /// deadline passes.
    pub async fn wait(mut self) -> Result<Reply, RealtimeError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(RealtimeError::Cancelled);
        };
        let outcome = tokio::time::timeout_at(self.deadline, rx).await;
        self.rx = None;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RealtimeError::Cancelled),
            Err(_) => {
                self.channel.evict(&self.msg_ref);
                Err(RealtimeError::PushTimeout {
                    topic: self.channel.topic().to_string(),
                    event: self.event.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.channel.evict(&self.msg_ref);
        }
    }
}
