use crate::models::SessionConfig;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "SESSION_CONFIG_PATH";

/// Load session configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SessionConfig, String> {
    let path = path.as_ref();
    info!("Loading session configuration from: {}", path.display());

    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

    let config = parse_config(&contents)?;

    info!(
        "Session configuration loaded: cookie '{}', ttl {}s, sweep every {}ms",
        config.cookie_name, config.ttl_seconds, config.sweep_interval_ms
    );

    Ok(config)
}

/// Parse and validate a YAML document
pub fn parse_config(contents: &str) -> Result<SessionConfig, String> {
    let config: SessionConfig = serde_yaml::from_str(contents)
        .map_err(|e| format!("Failed to parse YAML config: {}", e))?;

    config.validate()?;
    Ok(config)
}

/// Load configuration with fallback options
///
/// Tries `SESSION_CONFIG_PATH`, then `sessions.yaml` / `sessions.yml` in the
/// working directory, and finally falls back to the defaults.
pub fn load_config_with_fallback() -> SessionConfig {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        match load_config(&config_path) {
            Ok(config) => return config,
            Err(e) => warn!(
                "Failed to load config from {} ({}): {}",
                CONFIG_PATH_ENV, config_path, e
            ),
        }
    }

    for path in ["sessions.yaml", "sessions.yml"] {
        if Path::new(path).exists() {
            match load_config(path) {
                Ok(config) => return config,
                Err(e) => warn!("Failed to load config from '{}': {}", path, e),
            }
        }
    }

    info!("No session configuration file found, using defaults");
    SessionConfig::default()
}
