//! Configuration surface for the Ghost control plane.
//!
//! Mirrors the teacher's `AppConfig` + `ConfigLoader` shape: a `Default`
//! baseline, an optional TOML file, then per-field environment overrides
//! applied on top (see [`loader`]).

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use loader::{ConfigLoadError, ConfigLoader};

/// Top-level configuration for `ghostd` and the embedded agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub queue: QueueConfig,
    pub agent: AgentConfig,
    pub daemon: DaemonConfig,
    pub store: StoreConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            queue: QueueConfig::default(),
            agent: AgentConfig::default(),
            daemon: DaemonConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration the same way the binaries do: defaults, then an
    /// optional file, then environment overrides.
    pub fn load() -> Result<Self, ConfigLoadError> {
        ConfigLoader::new().load()
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigLoadError> {
        loader::load_from_file(path)
    }

    /// Emit an annotated TOML document describing every field, used for
    /// `ghostd --print-config` and for generating a starter config file.
    pub fn example_toml() -> String {
        r#"# Ghost control plane configuration

[bus]
# Default per-message retention before an undelivered message expires.
retention_seconds = 3600
# Channel subscription buffer capacity (messages held per active subscription).
subscription_capacity = 1024

[queue]
# Bounded outbound queue capacity; oldest envelope is dropped on overflow.
capacity = 1000
max_retries_low = 2
max_retries_normal = 5
max_retries_high = 10
max_retries_critical = 20
# Minimum pause, in milliseconds, before re-checking connectivity while disconnected.
disconnected_retry_pause_ms = 1000

[agent]
heartbeat_interval_secs = 30
metrics_interval_secs = 5
diagnostics_interval_secs = 300
reconnect_base_delay_ms = 5000
reconnect_max_delay_ms = 120000
reconnect_max_attempts = 5
reconnect_extended_delay_ms = 60000
command_timeout_secs = 30

[daemon]
staleness_threshold_secs = 120
staleness_scan_interval_secs = 30
stop_grace_period_secs = 10

[store]
cache_capacity = 10000
encryption_key_env = "GHOSTD_STORE_KEY"
circuit_failure_threshold = 5
circuit_success_threshold = 2
circuit_open_duration_secs = 30
"#
        .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub retention_seconds: u64,
    pub subscription_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 3600,
            subscription_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_retries_low: u32,
    pub max_retries_normal: u32,
    pub max_retries_high: u32,
    pub max_retries_critical: u32,
    pub disconnected_retry_pause_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_retries_low: 2,
            max_retries_normal: 5,
            max_retries_high: 10,
            max_retries_critical: 20,
            disconnected_retry_pause_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn disconnected_retry_pause(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub heartbeat_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub diagnostics_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_extended_delay_ms: u64,
    pub command_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            metrics_interval_secs: 5,
            diagnostics_interval_secs: 300,
            reconnect_base_delay_ms: 5000,
            reconnect_max_delay_ms: 120_000,
            reconnect_max_attempts: 5,
            reconnect_extended_delay_ms: 60_000,
            command_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostics_interval_secs)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub staleness_threshold_secs: u64,
    pub staleness_scan_interval_secs: u64,
    pub stop_grace_period_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: 120,
            staleness_scan_interval_secs: 30,
            stop_grace_period_secs: 10,
        }
    }
}

impl DaemonConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }
    pub fn staleness_scan_interval(&self) -> Duration {
        Duration::from_secs(self.staleness_scan_interval_secs)
    }
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub cache_capacity: usize,
    pub encryption_key_env: String,
    pub circuit_failure_threshold: u32,
    pub circuit_success_threshold: u32,
    pub circuit_open_duration_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            encryption_key_env: "GHOSTD_STORE_KEY".to_string(),
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_open_duration_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn circuit_open_duration(&self) -> Duration {
        Duration::from_secs(self.circuit_open_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bus.retention_seconds, 3600);
        assert_eq!(cfg.queue.capacity, 1000);
        assert_eq!(cfg.queue.max_retries_critical, 20);
        assert_eq!(cfg.agent.reconnect_base_delay_ms, 5000);
        assert_eq!(cfg.daemon.staleness_threshold_secs, 120);
    }

    #[test]
    fn example_toml_parses_into_default() {
        let parsed: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert_eq!(parsed, AppConfig::default());
    }
}
