//! Event names and application payloads carried inside Phoenix envelopes.
//!
//! The envelope itself and its serializers live in `transport::envelope`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved topic used for heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub mod events {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PHX_JOIN: &str = "phx_join";
    pub const PHX_REPLY: &str = "phx_reply";
    pub const PHX_LEAVE: &str = "phx_leave";
    pub const PHX_ERROR: &str = "phx_error";
    pub const PHX_CLOSE: &str = "phx_close";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const BACKPRESSURE_CONFIG: &str = "backpressure_config";
    pub const MEASUREMENT: &str = "measurement";
    pub const MEASUREMENT_BATCH: &str = "measurement_batch";
    pub const MOVEMENT: &str = "movement";
}

/// Topic a sensor's measurements and control messages travel on.
pub fn sensor_topic(sensor_id: &str) -> String {
    format!("sensor:{sensor_id}")
}

/// Inverse of [`sensor_topic`].
pub fn sensor_id_from_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix("sensor:").filter(|id| !id.is_empty())
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// One sample for a sensor attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub payload: serde_json::Value,
    pub timestamp: u64,
    pub attribute_id: String,
}

impl Measurement {
    /// Stamp a sample with the current wall-clock time.
    pub fn now(attribute_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            payload,
            timestamp: now_ms(),
            attribute_id: attribute_id.into(),
        }
    }
}

/// Payload of a `measurement_batch` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementBatch {
    pub measurements: Vec<Measurement>,
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

/// How closely the server says someone is watching a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionLevel {
    #[default]
    High,
    Medium,
    Low,
    None,
}

impl AttentionLevel {
    pub fn default_batch_window_ms(self) -> u64 {
        match self {
            AttentionLevel::High => 100,
            AttentionLevel::Medium => 500,
            AttentionLevel::Low => 2_000,
            AttentionLevel::None => 5_000,
        }
    }

    pub fn default_batch_size(self) -> usize {
        match self {
            AttentionLevel::High => 1,
            AttentionLevel::Medium => 5,
            AttentionLevel::Low => 10,
            AttentionLevel::None => 20,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttentionLevel::High => "high",
            AttentionLevel::Medium => "medium",
            AttentionLevel::Low => "low",
            AttentionLevel::None => "none",
        }
    }
}

impl fmt::Display for AttentionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttentionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(AttentionLevel::High),
            "medium" => Ok(AttentionLevel::Medium),
            "low" => Ok(AttentionLevel::Low),
            "none" => Ok(AttentionLevel::None),
            other => Err(format!("unknown attention level: {other}")),
        }
    }
}

/// Server-pushed `backpressure_config` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfigPayload {
    pub attention_level: AttentionLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_batch_window: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}
