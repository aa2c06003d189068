use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures raised by the socket, channels, and the backpressure controller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    /// Endpoint unreachable or the WebSocket handshake failed. Retried with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected our credentials. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not connected")]
    NotConnected,

    #[error("join on {topic} timed out after {timeout_ms}ms")]
    JoinTimeout { topic: String, timeout_ms: u64 },

    #[error("join on {topic} rejected: {reason}")]
    JoinRejected { topic: String, reason: String },

    #[error("push '{event}' on {topic} timed out after {timeout_ms}ms")]
    PushTimeout {
        topic: String,
        event: String,
        timeout_ms: u64,
    },

    #[error("push '{event}' on {topic} rejected: {response}")]
    PushRejected {
        topic: String,
        event: String,
        response: serde_json::Value,
    },

    #[error("channel {0} is not joined")]
    ChannelNotJoined(String),

    #[error("channel {0} closed")]
    ChannelClosed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("buffer for stream {stream} overflowed, dropped {dropped} entries")]
    BufferOverflow { stream: String, dropped: usize },

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),
}

impl RealtimeError {
    /// Whether the failure ends the connection for good (no reconnect).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RealtimeError::Auth(_) | RealtimeError::RetriesExhausted(_) | RealtimeError::Cancelled
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorLinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
