//! Daemon-side communication server (C6): subscribes to the peer-facing
//! channels, maintains the peer registry, and runs the periodic staleness
//! scan.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use ghost_bus::{Bus, Delivery};
use ghost_common::{Payload, Priority, SystemEvent, SystemEventType};

use crate::registry::PeerRegistry;

/// Extract the peer id suffix from a concrete channel like `health:app-1` or
/// `metrics:app-1` (§4.6 step 1).
fn peer_id_from_channel(channel: &str) -> Option<&str> {
    channel.rsplit_once(':').map(|(_, id)| id)
}

pub struct CommunicationServer {
    bus: Arc<dyn Bus>,
    registry: Arc<PeerRegistry>,
    staleness_threshold_secs: i64,
    staleness_scan_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl CommunicationServer {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Arc<PeerRegistry>,
        staleness_threshold_secs: i64,
        staleness_scan_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bus,
            registry,
            staleness_threshold_secs,
            staleness_scan_interval,
            shutdown_tx,
        }
    }

    /// Subscribe to `health:*`, `metrics:*`, and `events`, plus spawn the
    /// staleness scanner. Each subscription runs on its own task.
    pub async fn start(self: Arc<Self>) -> ghost_bus::Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = Vec::new();

        let health_metrics = self.bus.clone().subscribe("health:*").await?;
        handles.push(self.clone().spawn_health_metrics_loop(health_metrics, "health"));

        let metrics = self.bus.clone().subscribe("metrics:*").await?;
        handles.push(self.clone().spawn_health_metrics_loop(metrics, "metrics"));

        let events = self.bus.clone().subscribe("events").await?;
        handles.push(self.clone().spawn_events_loop(events));

        handles.push(self.clone().spawn_staleness_loop());

        Ok(handles)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_health_metrics_loop(
        self: Arc<Self>,
        mut sub: ghost_bus::Subscription,
        label: &'static str,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = sub.next() => {
                        match delivery {
                            Some(d) => self.handle_health_or_metrics(d),
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(label, "communication server subscription shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Single handler dispatching by decoded payload kind — collapses what
    /// could have been two racing `health:*` listeners into one subscription
    /// (§9 open-question decision). All three payload kinds — heartbeat,
    /// health, and metrics — reconnect a `Disconnected` peer back to
    /// `Running` via `PeerRegistry::record_message`, not just metrics (§9
    /// open-question decision: any of the three proves the peer isn't
    /// silent anymore).
    fn handle_health_or_metrics(&self, delivery: Delivery) {
        let Some(peer_id) = peer_id_from_channel(&delivery.channel).map(str::to_string) else {
            warn!(channel = %delivery.channel, "could not extract peer id from channel");
            return;
        };

        match delivery.payload {
            Payload::Heartbeat(hb) => {
                let reconnected = self.registry.record_message(&peer_id, &hb.app_type, None);
                if reconnected {
                    self.emit_connection_event(&peer_id, SystemEventType::ConnectionConnected);
                }
            }
            Payload::Health(health) => {
                let reconnected = self.registry.record_message(&peer_id, &health.app_type, None);
                if reconnected {
                    self.emit_connection_event(&peer_id, SystemEventType::ConnectionConnected);
                }
            }
            Payload::Metrics(m) => {
                let report = ghost_common::MetricsReport {
                    process_id: peer_id.clone(),
                    metrics: m,
                    timestamp: delivery_timestamp(),
                };
                let app_type_hint = self
                    .registry
                    .get(&peer_id)
                    .map(|r| r.metadata.process_type)
                    .unwrap_or_else(|| "unknown".to_string());
                let reconnected = self
                    .registry
                    .record_message(&peer_id, &app_type_hint, Some(report));
                if reconnected {
                    self.emit_connection_event(&peer_id, SystemEventType::ConnectionConnected);
                }
            }
            other => {
                warn!(channel = %delivery.channel, payload = ?other, "unexpected payload on health/metrics channel");
            }
        }
    }

    fn spawn_events_loop(self: Arc<Self>, mut sub: ghost_bus::Subscription) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = sub.next() => {
                        match delivery {
                            Some(d) => self.handle_event(d),
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("events subscription shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn handle_event(&self, delivery: Delivery) {
        let Payload::Event(event) = delivery.payload else {
            return;
        };
        match event.event_type {
            SystemEventType::ProcessRegistered => {
                if let Some(data) = event.data {
                    match serde_json::from_slice(&data) {
                        Ok(info) => self.registry.upsert_registered(info),
                        Err(e) => warn!(error = %e, "malformed process.registered event"),
                    }
                }
            }
            SystemEventType::ProcessStopped => {
                self.registry.mark_stopped(&event.process_id);
            }
            SystemEventType::ProcessCrashed => {
                self.registry.mark_crashed(&event.process_id);
            }
            _ => {}
        }
    }

    fn emit_connection_event(&self, peer_id: &str, event_type: SystemEventType) {
        let event = SystemEvent::new(event_type, peer_id.to_string());
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let _ = bus
                .publish_with_priority("events", Payload::Event(event), Priority::Normal)
                .await;
        });
    }

    fn spawn_staleness_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.staleness_scan_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stale = self.registry.scan_stale(self.staleness_threshold_secs);
                        for id in stale {
                            self.emit_connection_event(&id, SystemEventType::ConnectionDisconnected);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("staleness scan shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn delivery_timestamp() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_bus::InMemoryBus;
    use ghost_common::Heartbeat;

    #[tokio::test]
    async fn heartbeat_auto_registers_and_marks_last_seen() {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(PeerRegistry::new());
        let server = Arc::new(CommunicationServer::new(
            bus.clone(),
            registry.clone(),
            120,
            Duration::from_secs(30),
        ));
        let _handles = server.clone().start().await.unwrap();

        let hb = Heartbeat {
            id: "svc-1".to_string(),
            status: "ok".to_string(),
            timestamp: chrono::Utc::now(),
            app_type: "worker".to_string(),
        };
        bus.publish_with_priority("health:svc-1", Payload::Heartbeat(hb), Priority::Normal)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.contains("svc-1"));
    }

    #[test]
    fn peer_id_extraction_uses_last_colon_segment() {
        assert_eq!(peer_id_from_channel("health:svc-1"), Some("svc-1"));
        assert_eq!(peer_id_from_channel("metrics:conn:abc"), Some("abc"));
        assert_eq!(peer_id_from_channel("events"), None);
    }
}
