//! Where the config file lives and how the default one is written.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use sensorlink_common::ConfigError;
use tracing::info;

use super::template::default_config_toml;

const APP_DIR: &str = "sensorlink";
const FILE_NAME: &str = "config.toml";

/// `<platform config dir>/sensorlink/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(FILE_NAME))
        .ok_or_else(|| ConfigError::ParseError("no platform config directory".into()))
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> ConfigError {
    ConfigError::ParseError(format!("{action} {}: {e}", path.display()))
}

/// Write the documented default config. Never overwrites an existing file.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_error("cannot create", dir, e))?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| io_error("cannot create", path, e))?;
    file.write_all(default_config_toml().as_bytes())
        .map_err(|e| io_error("cannot write", path, e))?;

    info!(path = %path.display(), "Wrote default config");
    Ok(())
}
