//! Full configuration validation.
//!
//! Checks numeric ranges and enumerated strings, collecting every problem
//! into a single `ConfigError`.

mod helpers;

#[cfg(test)]
mod tests;

use crate::schema::{SensorLinkConfig, CONFIG_SCHEMA_VERSION};
use helpers::{validate_one_of, validate_range};
use sensorlink_common::ConfigError;

/// Attention levels the backend may declare.
pub const ATTENTION_LEVELS: &[&str] = &["high", "medium", "low", "none"];

/// Supported serializer versions.
pub const SERIALIZER_VERSIONS: &[&str] = &["1.0.0", "2.0.0"];

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &SensorLinkConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if config.schema_version == 0 || config.schema_version > CONFIG_SCHEMA_VERSION {
        errors.push(format!(
            "schema_version = {} is not supported (expected 1..={CONFIG_SCHEMA_VERSION})",
            config.schema_version
        ));
    }

    let conn = &config.connection;
    if !(conn.url.starts_with("ws://") || conn.url.starts_with("wss://")) {
        errors.push(format!(
            "connection.url = {:?} must start with ws:// or wss://",
            conn.url
        ));
    }
    validate_one_of(&mut errors, "connection.vsn", &conn.vsn, SERIALIZER_VERSIONS);
    validate_range(
        &mut errors,
        "connection.connect_timeout_ms",
        conn.connect_timeout_ms,
        100,
        120_000,
    );
    validate_range(
        &mut errors,
        "connection.max_decode_errors",
        conn.max_decode_errors as u64,
        1,
        1_000,
    );

    let hb = &config.heartbeat;
    validate_range(&mut errors, "heartbeat.interval_ms", hb.interval_ms, 1_000, 300_000);
    if hb.timeout_ms < hb.interval_ms {
        errors.push(format!(
            "heartbeat.timeout_ms = {} must be >= heartbeat.interval_ms ({})",
            hb.timeout_ms, hb.interval_ms
        ));
    }

    let rc = &config.reconnect;
    validate_range(&mut errors, "reconnect.base_delay_ms", rc.base_delay_ms, 10, 60_000);
    if rc.max_delay_ms < rc.base_delay_ms {
        errors.push(format!(
            "reconnect.max_delay_ms = {} must be >= reconnect.base_delay_ms ({})",
            rc.max_delay_ms, rc.base_delay_ms
        ));
    }

    let ch = &config.channel;
    validate_range(&mut errors, "channel.join_timeout_ms", ch.join_timeout_ms, 100, 120_000);
    validate_range(&mut errors, "channel.push_timeout_ms", ch.push_timeout_ms, 100, 120_000);
    if ch.rejoin_delays_ms.is_empty() {
        errors.push("channel.rejoin_delays_ms must not be empty".into());
    }

    let bp = &config.backpressure;
    validate_one_of(
        &mut errors,
        "backpressure.default_attention",
        &bp.default_attention,
        ATTENTION_LEVELS,
    );
    validate_range(
        &mut errors,
        "backpressure.max_buffered",
        bp.max_buffered as u64,
        1,
        1_000_000,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
