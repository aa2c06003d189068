//! Socket endpoint and wire settings.

use serde::{Deserialize, Serialize};

/// Where and how to open the WebSocket.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Socket endpoint, e.g. `wss://example.com/socket/websocket`.
    pub url: String,
    /// Bearer token sent as the `token` query parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Serializer version: `"2.0.0"` (array frames) or `"1.0.0"` (map frames).
    pub vsn: String,
    /// Per-attempt handshake timeout.
    pub connect_timeout_ms: u64,
    /// Consecutive undecodable frames tolerated before the session is dropped.
    pub max_decode_errors: u32,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("vsn", &self.vsn)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("max_decode_errors", &self.max_decode_errors)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/socket/websocket".into(),
            auth_token: None,
            vsn: "2.0.0".into(),
            connect_timeout_ms: 15_000,
            max_decode_errors: 10,
        }
    }
}
