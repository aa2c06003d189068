//! Types shared between the [`Socket`](super::Socket) handle and its
//! background connection task.

use std::time::Duration;

use tokio::sync::oneshot;

use sensorlink_common::RealtimeError;
use sensorlink_config::SensorLinkConfig;

use super::envelope::{Envelope, Serializer};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Transport-level settings.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub serializer: Serializer,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub jitter: bool,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    pub max_decode_errors: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(30);
        Self {
            serializer: Serializer::V2,
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * 2,
            connect_timeout: Duration::from_secs(15),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            jitter: true,
            max_retries: None,
            max_decode_errors: 10,
        }
    }
}

impl From<&SensorLinkConfig> for SocketConfig {
    fn from(cfg: &SensorLinkConfig) -> Self {
        Self {
            serializer: Serializer::from_vsn(&cfg.connection.vsn).unwrap_or_default(),
            heartbeat_interval: Duration::from_millis(cfg.heartbeat.interval_ms),
            heartbeat_timeout: Duration::from_millis(cfg.heartbeat.timeout_ms),
            connect_timeout: Duration::from_millis(cfg.connection.connect_timeout_ms),
            reconnect_base: Duration::from_millis(cfg.reconnect.base_delay_ms),
            reconnect_max: Duration::from_millis(cfg.reconnect.max_delay_ms),
            jitter: cfg.reconnect.jitter,
            max_retries: cfg.reconnect.max_retries,
            max_decode_errors: cfg.connection.max_decode_errors,
        }
    }
}

// ---------------------------------------------------------------------------
// State & events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the connection task reports upward.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A decoded frame for some topic. Heartbeat replies never appear here.
    Message(Envelope),
    /// A connection attempt or session failed. `terminal` means the task
    /// has stopped and will not reconnect.
    Failed { error: RealtimeError, terminal: bool },
}

/// Commands from the [`Socket`](super::Socket) handle to the connection task.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    Send {
        envelope: Envelope,
        ack: oneshot::Sender<Result<(), RealtimeError>>,
    },
    Disconnect,
}
