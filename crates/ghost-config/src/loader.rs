//! Configuration loader with file and environment variable support.

use crate::AppConfig;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

/// Standard config file search paths, checked in order.
const CONFIG_PATHS: &[&str] = &[
    "ghostd.toml",
    "config.toml",
    "./config/ghostd.toml",
    "/etc/ghostd/config.toml",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Parse an `AppConfig` from a TOML file at `path`.
pub fn load_from_file(path: &Path) -> Result<AppConfig, ConfigLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Locates and loads configuration, applying environment overrides on top.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader pinned to a specific config file path.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides.
    pub fn load(&self) -> Result<AppConfig, ConfigLoadError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = load_from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("GHOSTD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply `GHOSTD_*`-prefixed environment variable overrides.
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Bus
        if let Ok(val) = env::var("GHOSTD_BUS_RETENTION_SECONDS") {
            if let Ok(v) = val.parse() {
                config.bus.retention_seconds = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_BUS_SUBSCRIPTION_CAPACITY") {
            if let Ok(v) = val.parse() {
                config.bus.subscription_capacity = v;
            }
        }

        // Queue
        if let Ok(val) = env::var("GHOSTD_QUEUE_CAPACITY") {
            if let Ok(v) = val.parse() {
                config.queue.capacity = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_QUEUE_MAX_RETRIES_LOW") {
            if let Ok(v) = val.parse() {
                config.queue.max_retries_low = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_QUEUE_MAX_RETRIES_NORMAL") {
            if let Ok(v) = val.parse() {
                config.queue.max_retries_normal = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_QUEUE_MAX_RETRIES_HIGH") {
            if let Ok(v) = val.parse() {
                config.queue.max_retries_high = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_QUEUE_MAX_RETRIES_CRITICAL") {
            if let Ok(v) = val.parse() {
                config.queue.max_retries_critical = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_QUEUE_DISCONNECTED_RETRY_PAUSE_MS") {
            if let Ok(v) = val.parse() {
                config.queue.disconnected_retry_pause_ms = v;
            }
        }

        // Agent
        if let Ok(val) = env::var("GHOSTD_AGENT_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                config.agent.heartbeat_interval_secs = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_METRICS_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                config.agent.metrics_interval_secs = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_DIAGNOSTICS_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                config.agent.diagnostics_interval_secs = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_RECONNECT_BASE_DELAY_MS") {
            if let Ok(v) = val.parse() {
                config.agent.reconnect_base_delay_ms = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_RECONNECT_MAX_DELAY_MS") {
            if let Ok(v) = val.parse() {
                config.agent.reconnect_max_delay_ms = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                config.agent.reconnect_max_attempts = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_RECONNECT_EXTENDED_DELAY_MS") {
            if let Ok(v) = val.parse() {
                config.agent.reconnect_extended_delay_ms = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_AGENT_COMMAND_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                config.agent.command_timeout_secs = v;
            }
        }

        // Daemon
        if let Ok(val) = env::var("GHOSTD_DAEMON_STALENESS_THRESHOLD_SECS") {
            if let Ok(v) = val.parse() {
                config.daemon.staleness_threshold_secs = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_DAEMON_STALENESS_SCAN_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                config.daemon.staleness_scan_interval_secs = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_DAEMON_STOP_GRACE_PERIOD_SECS") {
            if let Ok(v) = val.parse() {
                config.daemon.stop_grace_period_secs = v;
            }
        }

        // Store
        if let Ok(val) = env::var("GHOSTD_STORE_CACHE_CAPACITY") {
            if let Ok(v) = val.parse() {
                config.store.cache_capacity = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_STORE_ENCRYPTION_KEY_ENV") {
            config.store.encryption_key_env = val;
        }
        if let Ok(val) = env::var("GHOSTD_STORE_CIRCUIT_FAILURE_THRESHOLD") {
            if let Ok(v) = val.parse() {
                config.store.circuit_failure_threshold = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_STORE_CIRCUIT_SUCCESS_THRESHOLD") {
            if let Ok(v) = val.parse() {
                config.store.circuit_success_threshold = v;
            }
        }
        if let Ok(val) = env::var("GHOSTD_STORE_CIRCUIT_OPEN_DURATION_SECS") {
            if let Ok(v) = val.parse() {
                config.store.circuit_open_duration_secs = v;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_explicit_path_over_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[queue]\ncapacity = 42\n").unwrap();

        let loader = ConfigLoader::with_path(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.queue.capacity, 42);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/ghostd.toml");
        let config = loader.load().unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn env_override_applies_on_top_of_file() {
        std::env::set_var("GHOSTD_QUEUE_CAPACITY", "7");
        let loader = ConfigLoader::new();
        let config = loader.load().unwrap();
        assert_eq!(config.queue.capacity, 7);
        std::env::remove_var("GHOSTD_QUEUE_CAPACITY");
    }
}
