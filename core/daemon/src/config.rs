//! Config file loading for the daemon.
//!
//! The shape and defaults live in `monitor_core::MonitorConfig`; this module
//! only resolves the path and parses TOML.

use monitor_core::MonitorConfig;
use std::env;
use std::path::PathBuf;

const CONFIG_ENV: &str = "CLAUDE_MONITOR_CONFIG";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".claude-monitor/config.toml";

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(value) = env::var(CONFIG_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<MonitorConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(MonitorConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read monitor config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<MonitorConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse monitor config {}: {}",
            config_path.display(),
            err
        )
    })?;
    config.validate().map_err(|err| {
        format!(
            "Invalid monitor config {}: {}",
            config_path.display(),
            err
        )
    })?;
    Ok(config)
}

/// Loads the config, falling back to defaults (with a warning) on any error.
pub fn load_or_default(path: Option<PathBuf>) -> MonitorConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to load monitor config; using defaults");
            MonitorConfig::default()
        }
    }
}
