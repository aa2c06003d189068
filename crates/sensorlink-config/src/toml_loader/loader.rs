//! Reading and validating a config file.

use std::path::Path;

use sensorlink_common::ConfigError;
use tracing::{debug, info};

use super::paths::{create_default_config, default_config_path};
use crate::schema::SensorLinkConfig;
use crate::validation;

/// Parse and validate the TOML file at `path`.
///
/// Absent keys take their serde defaults. Out-of-range timings are an
/// error rather than being clamped, since the client cannot run on them.
pub fn load_from_path(path: &Path) -> Result<SensorLinkConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::ParseError(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };

    let config: SensorLinkConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
    validation::validate(&config)?;

    info!(path = %path.display(), url = %config.connection.url, "Loaded config");
    Ok(config)
}

/// Load the platform default file, writing a documented one on first run.
pub fn load_default() -> Result<SensorLinkConfig, ConfigError> {
    let path = default_config_path()?;
    match load_from_path(&path) {
        Err(ConfigError::FileNotFound(_)) => {
            debug!(path = %path.display(), "No config file yet");
            create_default_config(&path)?;
            Ok(SensorLinkConfig::default())
        }
        other => other,
    }
}
