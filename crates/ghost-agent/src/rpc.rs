//! Request/response RPC over the bus (`sendCommand`, §4.4).
//!
//! A command is enqueued on the outbound queue (or sent directly through the
//! fallback transport in Degraded mode) while the caller concurrently
//! subscribes to a per-call response channel, racing against a timeout.

use ghost_bus::Bus;
use ghost_common::{Command, Payload, Priority, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{AgentError, Result};

/// The app-side direct-transport escape hatch used while `Degraded`.
#[async_trait::async_trait]
pub trait FallbackTransport: Send + Sync {
    async fn register_process(&self, info: ghost_common::ProcessInfo) -> Result<()>;
    async fn send_command_with_response(&self, command: Command) -> Result<Response>;
}

/// What the caller wants to run, before a `commandId`/`responseChannel` are
/// attached.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub command_type: String,
    pub target_process_id: Option<String>,
    pub parameters: HashMap<String, String>,
    pub data: Option<Vec<u8>>,
}

pub struct RpcClient {
    connection_id: String,
    bus: Arc<dyn Bus>,
    nonce: AtomicU64,
    command_timeout: Duration,
}

impl RpcClient {
    pub fn new(connection_id: impl Into<String>, bus: Arc<dyn Bus>, command_timeout: Duration) -> Self {
        Self {
            connection_id: connection_id.into(),
            bus,
            nonce: AtomicU64::new(0),
            command_timeout,
        }
    }

    fn build_command(&self, req: CommandRequest) -> (Command, String, Priority) {
        let command_id = uuid::Uuid::new_v4().to_string();
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let response_channel = format!("responses:{}:{}", self.connection_id, nonce);

        let mut parameters = req.parameters;
        parameters.insert("responseChannel".to_string(), response_channel.clone());

        let priority = Command::default_priority(&req.command_type);
        let command = Command {
            command_id,
            command_type: req.command_type,
            target_process_id: req.target_process_id,
            parameters,
            data: req.data,
            timestamp: chrono::Utc::now(),
        };
        (command, response_channel, priority)
    }

    /// Direct (Degraded-mode) dispatch: bypasses the bus and outbound queue
    /// entirely.
    pub async fn send_via_fallback(
        &self,
        fallback: &dyn FallbackTransport,
        req: CommandRequest,
    ) -> Result<Response> {
        let (command, _channel, _priority) = self.build_command(req);
        fallback.send_command_with_response(command).await
    }

    /// Bus-mediated dispatch (§4.4 steps 4-5): enqueue the command envelope
    /// through `enqueue`, then race a subscription to the response channel
    /// against the configured timeout.
    pub async fn send_via_bus<F>(&self, commands_channel: &str, req: CommandRequest, mut enqueue: F) -> Result<Response>
    where
        F: FnMut(ghost_common::Envelope),
    {
        let (command, response_channel, priority) = self.build_command(req);
        let command_id = command.command_id.clone();

        let mut subscription = self
            .bus
            .clone()
            .subscribe(&response_channel)
            .await
            .map_err(AgentError::from)?;

        enqueue(ghost_common::Envelope::new(
            commands_channel,
            Payload::Command(command),
            ghost_common::EnvelopeKind::Command,
            priority,
        ));

        let deadline = timeout(self.command_timeout, async {
            loop {
                match subscription.next().await {
                    Some(delivery) => {
                        if let Payload::Response(resp) = delivery.payload {
                            if resp.command_id == command_id {
                                return resp;
                            }
                        }
                    }
                    None => return Response::timed_out(&command_id),
                }
            }
        })
        .await;

        self.bus.unsubscribe(&response_channel).await.ok();

        match deadline {
            Ok(resp) => Ok(resp),
            Err(_) => {
                warn!(command_id = %command_id, "command timed out waiting for response");
                Ok(Response::timed_out(command_id))
            }
        }
    }
}

impl From<ghost_bus::BusError> for AgentError {
    fn from(e: ghost_bus::BusError) -> Self {
        match e {
            ghost_bus::BusError::Core(core) => AgentError::Core(core),
            ghost_bus::BusError::InvalidPattern(pattern, msg) => {
                AgentError::Config(format!("invalid channel pattern {pattern:?}: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_bus::InMemoryBus;
    use ghost_common::EnvelopeKind;
    use std::sync::Mutex;

    #[tokio::test]
    async fn round_trips_a_response_matched_by_command_id() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let client = RpcClient::new("conn-1", bus.clone(), Duration::from_secs(2));

        let captured: Arc<Mutex<Option<ghost_common::Envelope>>> = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();

        let req = CommandRequest {
            command_type: "ping".to_string(),
            ..Default::default()
        };

        let bus_for_responder = bus.clone();
        let response_task = {
            let captured = captured.clone();
            tokio::spawn(async move {
                loop {
                    let taken = captured.lock().unwrap().take();
                    if let Some(env) = taken {
                        if let Payload::Command(cmd) = env.payload {
                            let channel = cmd.parameters.get("responseChannel").unwrap().clone();
                            bus_for_responder
                                .publish(&channel, Payload::Response(Response::ok(cmd.command_id)))
                                .await
                                .unwrap();
                        }
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let result = client
            .send_via_bus("commands", req, |env| {
                assert_eq!(env.kind, EnvelopeKind::Command);
                *captured_clone.lock().unwrap() = Some(env);
            })
            .await
            .unwrap();

        response_task.await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn times_out_when_no_response_arrives() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let client = RpcClient::new("conn-2", bus, Duration::from_millis(50));
        let req = CommandRequest {
            command_type: "status".to_string(),
            ..Default::default()
        };
        let result = client.send_via_bus("commands", req, |_env| {}).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Command timed out"));
    }
}
