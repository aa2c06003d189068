use crate::schema::CONFIG_SCHEMA_VERSION;

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    format!(
        r##"# SensorLink Configuration
# Only override what you want to change -- missing fields use defaults.

schema_version = {CONFIG_SCHEMA_VERSION}

[connection]
url = "ws://localhost:4000/socket/websocket"
# auth_token = "..."         # sent as ?token=...
# vsn = "2.0.0"              # "2.0.0" array frames, "1.0.0" map frames
# connect_timeout_ms = 15000 # 100-120000
# max_decode_errors = 10     # 1-1000

[heartbeat]
# interval_ms = 30000        # 1000-300000
# timeout_ms = 60000         # >= interval_ms

[reconnect]
# base_delay_ms = 1000       # 10-60000
# max_delay_ms = 30000       # >= base_delay_ms
# jitter = true
# max_retries = 20           # unset: retry forever

[channel]
# join_timeout_ms = 10000    # 100-120000
# push_timeout_ms = 10000    # 100-120000
# rejoin_delays_ms = [1000, 2000, 5000, 10000]

[backpressure]
# default_attention = "high" # high | medium | low | none
# max_buffered = 1000        # 1-1000000
"##
    )
}
