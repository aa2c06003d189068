use serde::{Deserialize, Serialize};

/// Heartbeat cadence on the reserved `phoenix` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// How long a heartbeat may go unanswered before the connection is dropped.
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 60_000,
        }
    }
}
