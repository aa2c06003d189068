use serde_json::Value;
use tokio::sync::mpsc;

use crate::transport::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
            ChannelState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `ok` `phx_reply`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: String,
    pub response: Value,
}

/// What a successful join resolves with.
pub type JoinedReply = Reply;

/// Outcome of routing one inbound envelope through a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// A join reply moved the channel to Joined.
    Joined(Reply),
    /// A join was rejected or the server sent `phx_error`.
    Errored { reason: String },
    /// The server sent `phx_close`.
    Closed,
    /// A non-reply event, already fanned out to subscribers.
    Event(Envelope),
    /// A push reply was matched to its waiter.
    Replied,
    /// Stale or unmatched; nothing happened.
    Ignored,
}

/// Receiver for one event name on one channel. See [`Channel::on`](super::Channel::on).
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) event: String,
    pub(crate) rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next payload, in arrival order. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}
