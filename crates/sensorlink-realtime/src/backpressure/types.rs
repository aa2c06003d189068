use std::time::Duration;

use crate::protocol::{AttentionLevel, BackpressureConfigPayload};

/// Active batching policy for one outbound stream. Replaced wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    pub attention_level: AttentionLevel,
    pub batch_window: Duration,
    /// Flush once this many entries are buffered. Never zero.
    pub batch_size: usize,
}

impl BackpressureConfig {
    /// The level's default window and size.
    pub fn for_level(level: AttentionLevel) -> Self {
        Self {
            attention_level: level,
            batch_window: Duration::from_millis(level.default_batch_window_ms()),
            batch_size: level.default_batch_size(),
        }
    }

    /// Server recommendations win; missing ones fall back to the level's defaults.
    pub fn from_payload(payload: &BackpressureConfigPayload) -> Self {
        let defaults = Self::for_level(payload.attention_level);
        Self {
            attention_level: payload.attention_level,
            batch_window: payload
                .recommended_batch_window
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_window),
            batch_size: payload
                .recommended_batch_size
                .unwrap_or(defaults.batch_size)
                .max(1),
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self::for_level(AttentionLevel::High)
    }
}
