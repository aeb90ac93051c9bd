//! The connection agent (C4): owns the connection state machine, the
//! outbound queue's sender loop, registration, and graceful shutdown.
//!
//! State-mutex-guards-transitions is the same concurrency shape the teacher
//! used for its central orchestrator: one lock around the small amount of
//! mutable state that must change atomically, with the heavier per-task work
//! (timers, sending) running on its own `tokio::spawn`'d task.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ghost_bus::Bus;
use ghost_common::{
    Envelope, EnvelopeKind, Payload, Priority, ProcessInfo, Response, Statistics, SystemEvent,
    SystemEventType,
};
use ghost_config::AgentConfig;
use ghost_queue::OutboundQueue;

use crate::diagnostics::{DiagnosticResults, DiagnosticsProbe};
use crate::error::{AgentError, Result};
use crate::lifecycle::AgentLifecycle;
use crate::reconnect::ReconnectPolicy;
use crate::rpc::{CommandRequest, FallbackTransport, RpcClient};

pub const COMMANDS_CHANNEL: &str = "commands";

/// App-side connection state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    /// Connected via the fallback direct transport rather than the bus.
    Degraded,
    Disconnected,
    Stopped,
}

struct Inner {
    state: ConnectionState,
    attempts: u32,
    consecutive_failures: u32,
}

pub struct ConnectionAgent {
    connection_id: String,
    info: ProcessInfo,
    is_self: bool,
    bus: Arc<dyn Bus>,
    outbound: OutboundQueue,
    config: AgentConfig,
    disconnected_retry_pause: Duration,
    reconnect_policy: ReconnectPolicy,
    fallback: Option<Arc<dyn FallbackTransport>>,
    probe: DiagnosticsProbe,
    rpc: RpcClient,
    inner: Mutex<Inner>,
    stats: Mutex<Statistics>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Option<AgentLifecycle>>,
    auto_start_daemon_allowed: bool,
    self_weak: Weak<ConnectionAgent>,
}

impl ConnectionAgent {
    pub fn new(
        info: ProcessInfo,
        bus: Arc<dyn Bus>,
        config: AgentConfig,
        queue_config: &ghost_config::QueueConfig,
        daemon_process_name: impl Into<String>,
        fallback: Option<Arc<dyn FallbackTransport>>,
        auto_start_daemon_allowed: bool,
    ) -> Arc<Self> {
        let connection_id = ghost_common::ConnectionId::new().to_string();
        let is_self = info.is_daemon_self();
        let probe = DiagnosticsProbe::new(bus.clone(), daemon_process_name);
        let rpc = RpcClient::new(connection_id.clone(), bus.clone(), config.command_timeout());
        let reconnect_policy = ReconnectPolicy::from_config(&config);
        let outbound = OutboundQueue::new(queue_config.capacity);
        let disconnected_retry_pause = queue_config.disconnected_retry_pause();

        Arc::new_cyclic(|weak| Self {
            connection_id,
            info,
            is_self,
            bus,
            outbound,
            config,
            disconnected_retry_pause,
            reconnect_policy,
            fallback,
            probe,
            rpc,
            inner: Mutex::new(Inner {
                state: ConnectionState::Created,
                attempts: 0,
                consecutive_failures: 0,
            }),
            stats: Mutex::new(Statistics::default()),
            sender_task: Mutex::new(None),
            lifecycle: Mutex::new(None),
            auto_start_daemon_allowed,
            self_weak: weak.clone(),
        })
    }

    /// An owning handle to this agent, for tasks spawned from a `&self`
    /// method. Always upgradeable: every task holding it is itself reachable
    /// only from a live `Arc<ConnectionAgent>`.
    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("ConnectionAgent dropped while a method on it was still running")
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn app_type(&self) -> &str {
        &self.info.process_type
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn auto_start_daemon_allowed(&self) -> bool {
        self.auto_start_daemon_allowed
    }

    pub fn probe(&self) -> &DiagnosticsProbe {
        &self.probe
    }

    pub fn stats_mut(&self, f: impl FnOnce(&mut Statistics)) {
        f(&mut self.stats.lock());
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.lock().clone()
    }

    pub fn enqueue(&self, channel: impl Into<String>, payload: Payload, kind: EnvelopeKind, priority: Priority) {
        let envelope = Envelope::new(channel, payload, kind, priority);
        if self.outbound.enqueue(envelope).is_some() {
            self.stats_mut(|s| s.total_messages_dropped += 1);
        }
    }

    /// Entry point: `StartReporting()`. Skips the external connection check
    /// for the daemon-self exception and starts directly in `Connected`.
    pub async fn start_reporting(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Created {
                return Err(AgentError::AlreadyStarted);
            }
            inner.state = ConnectionState::Connecting;
        }

        if self.is_self {
            self.transition_connected(false).await;
        } else {
            self.attempt_connect().await;
        }

        let handle = tokio::spawn(self.arc().sender_loop());
        *self.sender_task.lock() = Some(handle);
        *self.lifecycle.lock() = Some(AgentLifecycle::start(self.arc()));

        Ok(())
    }

    async fn attempt_connect(&self) {
        let available = self.bus.is_available().await;
        if available {
            self.transition_connected(false).await;
        } else {
            self.transition_disconnected();
            self.schedule_reconnect();
        }
    }

    async fn transition_connected(&self, degraded: bool) {
        {
            let mut inner = self.inner.lock();
            inner.state = if degraded {
                ConnectionState::Degraded
            } else {
                ConnectionState::Connected
            };
            inner.attempts = 0;
            inner.consecutive_failures = 0;
        }
        self.stats_mut(|s| {
            s.total_connections += 1;
            s.last_connection_time = Some(chrono::Utc::now());
        });
        info!(connection_id = %self.connection_id, degraded, "agent connected");

        if !self.is_self {
            self.register().await;
        }
    }

    fn transition_disconnected(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Stopped {
            inner.state = ConnectionState::Disconnected;
        }
    }

    fn schedule_reconnect(&self) {
        let (attempt, consecutive_failures) = {
            let mut inner = self.inner.lock();
            inner.attempts += 1;
            inner.consecutive_failures += 1;
            (inner.attempts, inner.consecutive_failures)
        };
        self.stats_mut(|s| {
            s.total_reconnects += 1;
            s.last_error_time = Some(chrono::Utc::now());
        });
        let delay = self.reconnect_policy.delay_for(attempt, consecutive_failures);
        let agent = self.arc();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if agent.state() != ConnectionState::Stopped {
                agent.attempt_connect().await;
            }
        });
    }

    /// Registration on entering `Connected` (non-self), §4.4.
    async fn register(&self) {
        let register_req = CommandRequest {
            command_type: "register".to_string(),
            target_process_id: Some(self.info.id.clone()),
            data: serde_json::to_vec(&self.info).ok(),
            ..Default::default()
        };

        if let Err(e) = self
            .rpc
            .send_via_bus(COMMANDS_CHANNEL, register_req, |env| self.enqueue_direct(env))
            .await
        {
            warn!(error = %e, "registration command failed");
        }

        let registered = SystemEvent::new(SystemEventType::ProcessRegistered, self.info.id.clone())
            .with_data(serde_json::to_vec(&self.info).unwrap_or_default());
        self.enqueue("events", Payload::Event(registered), EnvelopeKind::Event, Priority::High);

        let started = SystemEvent::new(SystemEventType::ProcessStarted, self.info.id.clone());
        self.enqueue("events", Payload::Event(started.clone()), EnvelopeKind::Event, Priority::Normal);
        self.enqueue(
            format!("events:{}", self.info.id),
            Payload::Event(started),
            EnvelopeKind::Event,
            Priority::Normal,
        );

        self.stats_mut(|s| s.last_registration_time = Some(chrono::Utc::now()));
    }

    fn enqueue_direct(&self, envelope: Envelope) {
        if self.outbound.enqueue(envelope).is_some() {
            self.stats_mut(|s| s.total_messages_dropped += 1);
        }
    }

    /// `sendCommand` (§4.4): chooses fallback vs bus dispatch based on
    /// current state.
    pub async fn send_command(&self, req: CommandRequest) -> Result<Response> {
        self.stats_mut(|s| s.total_commands += 1);
        let result = if self.state() == ConnectionState::Degraded {
            let fallback = self.fallback.as_ref().ok_or(AgentError::NoFallback)?;
            self.rpc.send_via_fallback(fallback.as_ref(), req).await
        } else {
            self.rpc
                .send_via_bus(COMMANDS_CHANNEL, req, |env| self.enqueue_direct(env))
                .await
        };
        if let Ok(resp) = &result {
            if !resp.success && resp.error.as_deref() == Some("Command timed out") {
                self.stats_mut(|s| s.total_command_timeouts += 1);
            }
        }
        result
    }

    /// Diagnostics-driven transitions (§4.5): auto-switch to fallback, or
    /// request the daemon auto-start and schedule an immediate reconnect.
    pub async fn handle_diagnostics(&self, results: DiagnosticResults) {
        if !results.daemon_running && results.can_auto_start_daemon {
            info!("diagnostics requested daemon auto-start");
            let agent = self.arc();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                agent.attempt_connect().await;
            });
        }
        if !results.bus_available && results.can_use_fallback && self.fallback.is_some() {
            warn!("bus unavailable and fallback configured; switching to degraded mode");
            self.transition_connected(true).await;
        }
    }

    /// Sender loop (§4.3): drains the outbound queue and dispatches each
    /// envelope, honoring the disconnected/priority retry policy.
    async fn sender_loop(self: Arc<Self>) {
        loop {
            if self.state() == ConnectionState::Stopped {
                break;
            }

            let envelopes = self.outbound.drain();
            if envelopes.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            for mut envelope in envelopes {
                if self.state() == ConnectionState::Disconnected {
                    if envelope.priority < Priority::High {
                        envelope.retry_count += 1;
                        if envelope.can_retry() {
                            self.outbound.requeue_front(envelope);
                        } else {
                            self.stats_mut(|s| s.total_messages_dropped += 1);
                        }
                    } else {
                        // Held in-flight while disconnected: sitting in the
                        // queue waiting for reconnect isn't a send attempt, so
                        // it doesn't spend the retry budget. The budget is
                        // only spent once an actual publish fails, below.
                        self.outbound.requeue_front(envelope);
                    }
                    tokio::time::sleep(self.disconnected_retry_pause).await;
                    continue;
                }

                match self.bus.publish_with_priority(&envelope.channel, envelope.payload.clone(), envelope.priority).await {
                    Ok(()) => {
                        self.stats_mut(|s| {
                            s.total_messages_sent += 1;
                            s.consecutive_failures = 0;
                        });
                    }
                    Err(_) => {
                        self.stats_mut(|s| {
                            s.total_errors += 1;
                            s.consecutive_failures += 1;
                        });
                        self.transition_disconnected();
                        envelope.retry_count += 1;
                        if envelope.priority >= Priority::High && envelope.can_retry() {
                            self.stats_mut(|s| s.total_messages_requeued += 1);
                            self.outbound.requeue_front(envelope);
                        } else if envelope.priority < Priority::High {
                            self.stats_mut(|s| s.total_messages_requeued += 1);
                            self.outbound.requeue_front(envelope);
                        } else {
                            self.stats_mut(|s| s.total_messages_dropped += 1);
                        }
                        self.schedule_reconnect();
                    }
                }
            }
        }
    }

    /// `DisposeAsync` (§4.4): stop timers, best-effort-publish
    /// `process.stopped`, then mark `Stopped`.
    pub async fn stop(&self) {
        let was_connected = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Degraded
        );

        if was_connected && !self.is_self {
            let event = SystemEvent::new(SystemEventType::ProcessStopped, self.info.id.clone());
            let _ = self
                .bus
                .publish_with_priority("events", Payload::Event(event), Priority::High)
                .await;
        }

        self.inner.lock().state = ConnectionState::Stopped;

        if let Some(lifecycle) = self.lifecycle.lock().take() {
            lifecycle.shutdown().await;
        }
        if let Some(handle) = self.sender_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_bus::InMemoryBus;
    use std::collections::HashMap;

    fn test_info(id: &str, process_type: &str) -> ProcessInfo {
        ProcessInfo {
            id: id.to_string(),
            name: id.to_string(),
            process_type: process_type.to_string(),
            version: "0.1.0".to_string(),
            executable_path: String::new(),
            args: Vec::new(),
            working_dir: String::new(),
            environment: HashMap::new(),
            configuration: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn daemon_self_starts_connected_without_reconnect_loop() {
        let bus = Arc::new(InMemoryBus::new());
        let agent = ConnectionAgent::new(
            test_info("ghost-daemon", "daemon"),
            bus,
            AgentConfig::default(),
            &ghost_config::QueueConfig::default(),
            "ghostd",
            None,
            false,
        );
        agent.start_reporting().await.unwrap();
        assert_eq!(agent.state(), ConnectionState::Connected);
        agent.stop().await;
    }

    #[tokio::test]
    async fn normal_agent_registers_on_connect() {
        let bus = Arc::new(InMemoryBus::new());
        let mut registrations = Arc::clone(&bus).subscribe("events").await.unwrap();
        let agent = ConnectionAgent::new(
            test_info("svc-1", "worker"),
            bus,
            AgentConfig::default(),
            &ghost_config::QueueConfig::default(),
            "ghostd",
            None,
            false,
        );
        agent.start_reporting().await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), registrations.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.channel, "events");
        agent.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let bus = Arc::new(InMemoryBus::new());
        let agent = ConnectionAgent::new(
            test_info("svc-2", "worker"),
            bus,
            AgentConfig::default(),
            &ghost_config::QueueConfig::default(),
            "ghostd",
            None,
            false,
        );
        agent.start_reporting().await.unwrap();
        let err = agent.start_reporting().await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyStarted));
        agent.stop().await;
    }
}
