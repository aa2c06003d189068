use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use sensorlink_common::RealtimeError;
use sensorlink_config::SensorLinkConfig;

use crate::backpressure::{BackpressureConfig, DEFAULT_MAX_BUFFERED};
use crate::protocol::{AttentionLevel, Measurement};
use crate::transport::{ConnectionState, SocketConfig};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything a [`Client`](super::Client) needs to run.
#[derive(Clone)]
pub struct ClientConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub socket: SocketConfig,
    pub join_timeout: Duration,
    pub push_timeout: Duration,
    /// Delays between rejoin attempts for an errored channel; the last repeats.
    pub rejoin_delays: Vec<Duration>,
    /// Batching policy for a sensor stream until the server sends its own.
    pub default_backpressure: BackpressureConfig,
    pub max_buffered: usize,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("socket", &self.socket)
            .field("join_timeout", &self.join_timeout)
            .field("push_timeout", &self.push_timeout)
            .field("rejoin_delays", &self.rejoin_delays)
            .field("default_backpressure", &self.default_backpressure)
            .field("max_buffered", &self.max_buffered)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&SensorLinkConfig::default())
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Delay before rejoin attempt `attempt` (zero-based).
    pub(crate) fn rejoin_delay(&self, attempt: usize) -> Duration {
        self.rejoin_delays
            .get(attempt)
            .or(self.rejoin_delays.last())
            .copied()
            .unwrap_or(Duration::from_secs(10))
    }
}

impl From<&SensorLinkConfig> for ClientConfig {
    fn from(cfg: &SensorLinkConfig) -> Self {
        let level = cfg
            .backpressure
            .default_attention
            .parse::<AttentionLevel>()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to high attention");
                AttentionLevel::High
            });
        Self {
            url: cfg.connection.url.clone(),
            auth_token: cfg.connection.auth_token.clone(),
            socket: SocketConfig::from(cfg),
            join_timeout: Duration::from_millis(cfg.channel.join_timeout_ms),
            push_timeout: Duration::from_millis(cfg.channel.push_timeout_ms),
            rejoin_delays: cfg
                .channel
                .rejoin_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            default_backpressure: BackpressureConfig::for_level(level),
            max_buffered: if cfg.backpressure.max_buffered == 0 {
                DEFAULT_MAX_BUFFERED
            } else {
                cfg.backpressure.max_buffered
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything the client reports to its host.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionState(ConnectionState),
    ChannelJoined {
        topic: String,
    },
    ChannelError {
        topic: String,
        reason: String,
    },
    ChannelClosed {
        topic: String,
    },
    Measurement {
        topic: String,
        measurement: Measurement,
    },
    Movement {
        topic: String,
        payload: Value,
    },
    /// Any other server-pushed event.
    Event {
        topic: String,
        event: String,
        payload: Value,
    },
    PresenceJoin {
        topic: String,
        key: String,
        metas: Vec<Value>,
    },
    PresenceLeave {
        topic: String,
        key: String,
        metas: Vec<Value>,
    },
    Backpressure {
        topic: String,
        stream: String,
        config: BackpressureConfig,
    },
    Error {
        topic: Option<String>,
        error: RealtimeError,
    },
}

impl ClientEvent {
    /// Topic the event belongs to, if any.
    pub fn topic(&self) -> Option<&str> {
        match self {
            ClientEvent::ConnectionState(_) => None,
            ClientEvent::Error { topic, .. } => topic.as_deref(),
            ClientEvent::ChannelJoined { topic }
            | ClientEvent::ChannelError { topic, .. }
            | ClientEvent::ChannelClosed { topic }
            | ClientEvent::Measurement { topic, .. }
            | ClientEvent::Movement { topic, .. }
            | ClientEvent::Event { topic, .. }
            | ClientEvent::PresenceJoin { topic, .. }
            | ClientEvent::PresenceLeave { topic, .. }
            | ClientEvent::Backpressure { topic, .. } => Some(topic),
        }
    }
}
