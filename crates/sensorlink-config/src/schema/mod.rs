//! Configuration schema types for SensorLink.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod batching;
mod channel;
mod connection;
mod heartbeat;
mod reconnect;

pub use batching::*;
pub use channel::*;
pub use connection::*;
pub use heartbeat::*;
pub use reconnect::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration for SensorLink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorLinkConfig {
    /// Schema the file was written for. Files newer than this build are rejected.
    pub schema_version: u32,
    pub connection: ConnectionConfig,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub channel: ChannelTimingConfig,
    pub backpressure: BatchingConfig,
}

impl Default for SensorLinkConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            connection: ConnectionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            channel: ChannelTimingConfig::default(),
            backpressure: BatchingConfig::default(),
        }
    }
}
