//! SensorLink configuration.
//!
//! TOML-based configuration for the realtime client. Every section uses
//! serde defaults so a partial file (or none at all) works out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sensorlink_config::load_config;
//!
//! let config = load_config().expect("failed to load config");
//! println!("connecting to {}", config.connection.url);
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{
    BatchingConfig, ChannelTimingConfig, ConnectionConfig, HeartbeatConfig, ReconnectConfig,
    SensorLinkConfig, CONFIG_SCHEMA_VERSION,
};
pub use toml_loader::{create_default_config, default_config_path, load_default, load_from_path};

use sensorlink_common::ConfigError;

/// Load config from the platform default path, creating it when missing.
pub fn load_config() -> Result<SensorLinkConfig, ConfigError> {
    toml_loader::load_default()
}
