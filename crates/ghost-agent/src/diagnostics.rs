//! Diagnostics probe (C5): liveness checks used by the connection agent on
//! interval and on startup failure.
//!
//! The rolling-window counter is the same shape as the health service's
//! `RollingCounter` this was adapted from (a `Vec<(Instant, bool)>` pruned
//! by cutoff); here it tracks the probe's own recent success rate so
//! `recommended_actions` can flag a flapping bus rather than a single
//! transient failure.

use ghost_bus::Bus;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;

struct RollingCounter {
    window: Duration,
    events: RwLock<Vec<(Instant, bool)>>,
}

impl RollingCounter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            events: RwLock::new(Vec::new()),
        }
    }

    fn record(&self, success: bool) {
        let mut events = self.events.write();
        events.push((Instant::now(), success));
        let cutoff = Instant::now() - self.window;
        events.retain(|(t, _)| *t > cutoff);
    }

    fn success_rate(&self) -> Option<f64> {
        let events = self.events.read();
        let cutoff = Instant::now() - self.window;
        let recent: Vec<_> = events.iter().filter(|(t, _)| *t > cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let successes = recent.iter().filter(|(_, s)| *s).count();
        Some(successes as f64 / recent.len() as f64)
    }
}

/// Result of a diagnostics run (§4.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiagnosticResults {
    pub bus_available: bool,
    pub daemon_running: bool,
    pub network_ok: bool,
    pub has_permissions: bool,
    pub can_use_fallback: bool,
    pub can_auto_start_daemon: bool,
    pub message: String,
    pub recommended_actions: Vec<String>,
}

/// Input flags that vary by deployment (whether a fallback transport is
/// wired up, whether this agent is allowed to spawn the daemon).
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticRequest {
    pub fallback_configured: bool,
    pub auto_start_daemon_allowed: bool,
}

pub struct DiagnosticsProbe {
    bus: Arc<dyn Bus>,
    daemon_process_name: String,
    history: RollingCounter,
}

impl DiagnosticsProbe {
    pub fn new(bus: Arc<dyn Bus>, daemon_process_name: impl Into<String>) -> Self {
        Self {
            bus,
            daemon_process_name: daemon_process_name.into(),
            history: RollingCounter::new(Duration::from_secs(30 * 60)),
        }
    }

    /// True if a process named `daemon_process_name` is currently running
    /// on this host. The trust boundary is the local host (no cross-host
    /// clustering), so a simple process-table scan is sufficient.
    fn daemon_running(&self) -> bool {
        let mut system = System::new();
        system.refresh_processes();
        let found = system
            .processes_by_name(&self.daemon_process_name)
            .next()
            .is_some();
        found
    }

    pub async fn run(&self, request: DiagnosticRequest) -> DiagnosticResults {
        let bus_available = self.bus.is_available().await;
        self.history.record(bus_available);

        let daemon_running = daemon_running_or_self(self, &request);
        let network_ok = true; // local-host trust boundary; no cross-host reachability to check
        let has_permissions = true;

        let mut recommended_actions = Vec::new();
        if !bus_available {
            recommended_actions.push("check bus transport connectivity".to_string());
            if let Some(rate) = self.history.success_rate() {
                if rate < 0.5 {
                    recommended_actions.push("bus has been flapping over the last 30 minutes".to_string());
                }
            }
        }
        if !daemon_running && request.auto_start_daemon_allowed {
            recommended_actions.push("auto-starting daemon".to_string());
        } else if !daemon_running {
            recommended_actions.push("start the daemon process".to_string());
        }
        if !bus_available && request.fallback_configured {
            recommended_actions.push("switch to fallback transport".to_string());
        }

        let message = if bus_available && daemon_running {
            "all systems operational".to_string()
        } else {
            "degraded: see recommended actions".to_string()
        };

        DiagnosticResults {
            bus_available,
            daemon_running,
            network_ok,
            has_permissions,
            can_use_fallback: request.fallback_configured,
            can_auto_start_daemon: request.auto_start_daemon_allowed,
            message,
            recommended_actions,
        }
    }
}

fn daemon_running_or_self(probe: &DiagnosticsProbe, _request: &DiagnosticRequest) -> bool {
    probe.daemon_running()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_bus::InMemoryBus;

    #[tokio::test]
    async fn healthy_bus_yields_no_recommended_actions_for_bus() {
        let bus = Arc::new(InMemoryBus::new());
        let probe = DiagnosticsProbe::new(bus, "__never_running_ghost_test_proc__");
        let results = probe
            .run(DiagnosticRequest {
                fallback_configured: false,
                auto_start_daemon_allowed: false,
            })
            .await;
        assert!(results.bus_available);
        assert!(!results
            .recommended_actions
            .iter()
            .any(|a| a.contains("bus transport")));
    }

    #[tokio::test]
    async fn unavailable_bus_recommends_checking_transport() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_available(false);
        let probe = DiagnosticsProbe::new(bus, "__never_running_ghost_test_proc__");
        let results = probe
            .run(DiagnosticRequest {
                fallback_configured: true,
                auto_start_daemon_allowed: false,
            })
            .await;
        assert!(!results.bus_available);
        assert!(results
            .recommended_actions
            .iter()
            .any(|a| a.contains("bus transport")));
        assert!(results
            .recommended_actions
            .iter()
            .any(|a| a.contains("fallback")));
    }
}
