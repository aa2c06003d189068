//! Tests for the full validation pipeline.

use super::*;

#[test]
fn default_config_validates() {
    let config = SensorLinkConfig::default();
    assert!(validate(&config).is_ok());
}

#[test]
fn catches_non_websocket_url() {
    let mut config = SensorLinkConfig::default();
    config.connection.url = "http://example.com".into();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("connection.url"));
}

#[test]
fn catches_unknown_vsn() {
    let mut config = SensorLinkConfig::default();
    config.connection.vsn = "3.0.0".into();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("connection.vsn"));
}

#[test]
fn catches_heartbeat_timeout_below_interval() {
    let mut config = SensorLinkConfig::default();
    config.heartbeat.interval_ms = 30_000;
    config.heartbeat.timeout_ms = 10_000;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("heartbeat.timeout_ms"));
}

#[test]
fn catches_inverted_backoff_bounds() {
    let mut config = SensorLinkConfig::default();
    config.reconnect.base_delay_ms = 5_000;
    config.reconnect.max_delay_ms = 1_000;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("reconnect.max_delay_ms"));
}

#[test]
fn catches_empty_rejoin_schedule() {
    let mut config = SensorLinkConfig::default();
    config.channel.rejoin_delays_ms.clear();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("channel.rejoin_delays_ms"));
}

#[test]
fn catches_unknown_attention_level() {
    let mut config = SensorLinkConfig::default();
    config.backpressure.default_attention = "extreme".into();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("backpressure.default_attention"));
}

#[test]
fn collects_multiple_errors() {
    let mut config = SensorLinkConfig::default();
    config.channel.join_timeout_ms = 1;
    config.channel.push_timeout_ms = 1_000_000;
    config.backpressure.max_buffered = 0;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("channel.join_timeout_ms"));
    assert!(err.contains("channel.push_timeout_ms"));
    assert!(err.contains("backpressure.max_buffered"));
}

#[test]
fn rejects_newer_schema_version() {
    let mut config = SensorLinkConfig::default();
    config.schema_version = crate::CONFIG_SCHEMA_VERSION + 1;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("schema_version"));
}
