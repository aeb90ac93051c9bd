//! Background timer tasks for a connected agent (§4.4): heartbeat, metrics,
//! and diagnostics, each its own `tokio::spawn`'d loop racing a ticker
//! against a shared broadcast shutdown signal — the same shape as the
//! teacher's background-task orchestrator this was adapted from.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::agent::ConnectionAgent;
use crate::diagnostics::DiagnosticRequest;
use crate::metrics_sampler::CpuSampler;
use ghost_common::{EnvelopeKind, Heartbeat, MetricsReport, Payload, Priority};

/// Owns the shutdown broadcast and keeps the join handles of every timer
/// task spawned for a single connected agent instance.
pub struct AgentLifecycle {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl AgentLifecycle {
    /// Spawn the heartbeat/metrics/diagnostics timers for `agent`. Returns
    /// immediately; each task enqueues or runs the probe on its own
    /// schedule and never blocks the caller.
    pub fn start(agent: Arc<ConnectionAgent>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        // Heartbeat every 30s on health:{id}, priority Normal.
        {
            let agent = agent.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = agent.config().heartbeat_interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let hb = Heartbeat {
                                id: agent.connection_id().to_string(),
                                status: "ok".to_string(),
                                timestamp: chrono::Utc::now(),
                                app_type: agent.app_type().to_string(),
                            };
                            agent.enqueue(
                                format!("health:{}", agent.connection_id()),
                                Payload::Heartbeat(hb),
                                EnvelopeKind::Heartbeat,
                                Priority::Normal,
                            );
                            agent.stats_mut(|s| s.total_heartbeats += 1);
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("heartbeat timer shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Metrics every 5s on metrics:{id}, priority Low.
        {
            let agent = agent.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = agent.config().metrics_interval();
            handles.push(tokio::spawn(async move {
                let mut sampler = CpuSampler::for_current_process();
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Some(metrics) = sampler.sample() {
                                let report = MetricsReport {
                                    process_id: agent.connection_id().to_string(),
                                    metrics,
                                    timestamp: chrono::Utc::now(),
                                };
                                agent.enqueue(
                                    format!("metrics:{}", agent.connection_id()),
                                    Payload::Metrics(report.metrics),
                                    EnvelopeKind::Metrics,
                                    Priority::Low,
                                );
                                agent.stats_mut(|s| s.total_metrics_reports += 1);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("metrics timer shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Diagnostics every 5 min; may trigger fallback switch or daemon auto-start.
        {
            let agent = agent.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = agent.config().diagnostics_interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let results = agent
                                .probe()
                                .run(DiagnosticRequest {
                                    fallback_configured: agent.has_fallback(),
                                    auto_start_daemon_allowed: agent.auto_start_daemon_allowed(),
                                })
                                .await;
                            if !results.bus_available || !results.daemon_running {
                                warn!(?results, "diagnostics reported a degraded environment");
                            }
                            agent.handle_diagnostics(results).await;
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("diagnostics timer shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        info!(connection_id = %agent.connection_id(), "agent lifecycle timers started");

        Self {
            shutdown_tx,
            handles,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
