use serde::{Deserialize, Serialize};

/// Outbound measurement batching before the server sends its own config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// One of `high`, `medium`, `low`, `none`.
    pub default_attention: String,
    /// Entries retained per stream while flushes keep failing.
    pub max_buffered: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            default_attention: "high".into(),
            max_buffered: 1_000,
        }
    }
}
