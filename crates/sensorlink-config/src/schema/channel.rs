use serde::{Deserialize, Serialize};

/// Join/push deadlines and the rejoin schedule for errored channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelTimingConfig {
    pub join_timeout_ms: u64,
    pub push_timeout_ms: u64,
    /// Delay before each rejoin attempt; the last entry repeats.
    pub rejoin_delays_ms: Vec<u64>,
}

impl Default for ChannelTimingConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 10_000,
            push_timeout_ms: 10_000,
            rejoin_delays_ms: vec![1_000, 2_000, 5_000, 10_000],
        }
    }
}
