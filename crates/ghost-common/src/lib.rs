//! Core data model for the process supervisor and control plane.
//!
//! Types here are shared by every other crate in the workspace: the bus
//! (`ghost-bus`), the wire codec (`ghost-wire`), the outbound queue
//! (`ghost-queue`), the app-side agent (`ghost-agent`), and the daemon-side
//! communication server and supervisor (`ghost-daemon`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod logging;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque identifier for a single agent instance, assigned at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Process metadata
// ============================================================================

/// Static metadata describing a managed or self-reporting process. Immutable
/// after registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub process_type: String,
    pub version: String,
    pub executable_path: String,
    pub args: Vec<String>,
    pub working_dir: String,
    pub environment: HashMap<String, String>,
    pub configuration: HashMap<String, String>,
}

impl ProcessInfo {
    /// True when this metadata identifies the daemon process itself (the
    /// "daemon-self exception" of C4/C6 — no reconnect loop, no staleness).
    pub fn is_daemon_self(&self) -> bool {
        self.process_type.eq_ignore_ascii_case("daemon") || self.id == "ghost-daemon"
    }
}

// ============================================================================
// Envelope / priority / kind
// ============================================================================

/// Delivery priority. Ordering matters: comparisons like `priority < High`
/// in the outbound queue rely on declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Retry budget by priority (§4.3).
    pub fn max_retries(self) -> u32 {
        match self {
            Priority::Low => 2,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Critical => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Event,
    Command,
    Response,
    Heartbeat,
    Health,
    Metrics,
    Generic,
}

/// The typed payload an envelope carries. Kept as an enum (rather than raw
/// bytes at this layer) so in-process callers never pay a codec round trip;
/// `ghost-wire` encodes/decodes this type at the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Heartbeat(Heartbeat),
    Metrics(Metrics),
    Health(HealthStatus),
    Command(Command),
    Response(Response),
    Event(SystemEvent),
    Generic(Vec<u8>),
}

/// A message plus routing and retry metadata, owned by the outbound queue
/// until it is sent or dropped (§3 invariant: exactly one of outbound
/// queue / in-flight / terminal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: Payload,
    pub kind: EnvelopeKind,
    pub priority: Priority,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, payload: Payload, kind: EnvelopeKind, priority: Priority) -> Self {
        Self {
            channel: channel.into(),
            payload,
            kind,
            priority,
            created_at: chrono::Utc::now(),
            retry_count: 0,
            max_retries: priority.max_retries(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ============================================================================
// Wire message types (§3)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub id: String,
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub app_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub thread_count: u32,
    pub handle_count: u32,
    pub gc_total_bytes: u64,
    pub gen0: u32,
    pub gen1: u32,
    pub gen2: u32,
}

/// `Metrics` is `Copy`-able numerically but needs an owning `process_id` and
/// timestamp to travel on the wire; kept as a separate wrapper so the hot
/// sampling path (`ghost-agent`) can work with the cheap inner struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsReport {
    pub process_id: String,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Health-status severity drives the priority mapping used when enqueuing
/// onto the outbound queue (§3: `error|crashed`→High, `critical`→Critical,
/// else Normal).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub id: String,
    pub status: String,
    pub message: String,
    pub app_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthStatus {
    pub fn priority(&self) -> Priority {
        match self.status.to_ascii_lowercase().as_str() {
            "error" | "crashed" => Priority::High,
            "critical" => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub target_process_id: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub data: Option<Vec<u8>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Command {
    pub fn response_channel(&self) -> Option<&str> {
        self.parameters.get("responseChannel").map(String::as_str)
    }

    /// Priority mapping used by `sendCommand` (§4.4): ping/register/stop are
    /// High, everything else is Normal.
    pub fn default_priority(command_type: &str) -> Priority {
        match command_type {
            "ping" | "register" | "stop" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub command_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub data: Option<Vec<u8>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Response {
    pub fn ok(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            error: None,
            data: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            error: Some(error.into()),
            data: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Synthetic timeout response, per §4.4 step 5 / §7.
    pub fn timed_out(command_id: impl Into<String>) -> Self {
        Self::error(command_id, "Command timed out")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemEventType {
    #[serde(rename = "process.registered")]
    ProcessRegistered,
    #[serde(rename = "process_started")]
    ProcessStarted,
    #[serde(rename = "process.stopped")]
    ProcessStopped,
    #[serde(rename = "process.crashed")]
    ProcessCrashed,
    #[serde(rename = "connection.connected")]
    ConnectionConnected,
    #[serde(rename = "connection.disconnected")]
    ConnectionDisconnected,
    #[serde(rename = "connection.stopped")]
    ConnectionStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemEvent {
    #[serde(rename = "type")]
    pub event_type: SystemEventType,
    pub process_id: String,
    pub data: Option<Vec<u8>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SystemEvent {
    pub fn new(event_type: SystemEventType, process_id: impl Into<String>) -> Self {
        Self {
            event_type,
            process_id: process_id.into(),
            data: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }
}

// ============================================================================
// Peer / process lifecycle status
// ============================================================================

/// Unified status for both the daemon's connection-level peer registry (C6)
/// and the supervisor's process lifecycle state machine (C7). The two views
/// overlap in the spec (event handlers mutate the same record the supervisor
/// drives), so a single enum avoids two parallel, drifting state spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Disconnected,
}

impl PeerStatus {
    /// Transient states reject concurrent commands with `ConflictingState`.
    pub fn is_transient(self) -> bool {
        matches!(self, PeerStatus::Starting | PeerStatus::Stopping)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub metadata: ProcessInfo,
    pub status: PeerStatus,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub last_message: Option<chrono::DateTime<chrono::Utc>>,
    pub last_metrics: Option<MetricsReport>,
}

impl PeerRecord {
    pub fn new(id: impl Into<String>, metadata: ProcessInfo) -> Self {
        Self {
            id: id.into(),
            metadata,
            status: PeerStatus::Registered,
            last_seen: chrono::Utc::now(),
            last_message: None,
            last_metrics: None,
        }
    }

    /// Minimal auto-registration record for an unknown peer (§4.6 step 4).
    pub fn auto_register(id: &str, app_type: &str) -> Self {
        Self::new(
            id,
            ProcessInfo {
                id: id.to_string(),
                name: id.to_string(),
                process_type: "unknown".to_string(),
                version: String::new(),
                executable_path: String::new(),
                args: Vec::new(),
                working_dir: String::new(),
                environment: HashMap::new(),
                configuration: {
                    let mut m = HashMap::new();
                    m.insert("appType".to_string(), app_type.to_string());
                    m
                },
            },
        )
    }
}

// ============================================================================
// Agent-side statistics (§3)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_connections: u64,
    pub total_errors: u64,
    pub total_reconnects: u64,
    pub total_messages_sent: u64,
    pub total_messages_dropped: u64,
    pub total_messages_requeued: u64,
    pub total_heartbeats: u64,
    pub total_metrics_reports: u64,
    pub total_health_reports: u64,
    pub total_commands: u64,
    pub total_command_timeouts: u64,
    pub consecutive_failures: u32,
    pub last_connection_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_registration_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error_time: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// Error taxonomy (§7)
// ============================================================================

/// Stable error taxonomy shared across crates. Crate-local error types wrap
/// this with `#[from]` and add their own transport- or store-specific
/// variants rather than re-deriving the same names everywhere.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GhostError {
    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("conflicting state: {0}")]
    ConflictingState(String),

    #[error("timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("child process failure: {0}")]
    ChildProcessFailure(String),
}

pub type Result<T> = std::result::Result<T, GhostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_retry_budget() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::Low.max_retries(), 2);
        assert_eq!(Priority::Critical.max_retries(), 20);
    }

    #[test]
    fn health_status_priority_mapping() {
        let mut hs = HealthStatus {
            id: "a".into(),
            status: "error".into(),
            message: String::new(),
            app_type: "svc".into(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(hs.priority(), Priority::High);
        hs.status = "critical".into();
        assert_eq!(hs.priority(), Priority::Critical);
        hs.status = "ok".into();
        assert_eq!(hs.priority(), Priority::Normal);
    }

    #[test]
    fn command_response_channel_and_priority() {
        let mut params = HashMap::new();
        params.insert("responseChannel".to_string(), "responses:c1:1".to_string());
        let cmd = Command {
            command_id: "c1".into(),
            command_type: "ping".into(),
            target_process_id: None,
            parameters: params,
            data: None,
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(cmd.response_channel(), Some("responses:c1:1"));
        assert_eq!(Command::default_priority("ping"), Priority::High);
        assert_eq!(Command::default_priority("status"), Priority::Normal);
    }

    #[test]
    fn peer_status_transience() {
        assert!(PeerStatus::Starting.is_transient());
        assert!(PeerStatus::Stopping.is_transient());
        assert!(!PeerStatus::Running.is_transient());
    }

    #[test]
    fn envelope_retry_budget() {
        let env = Envelope::new(
            "events",
            Payload::Generic(vec![1, 2, 3]),
            EnvelopeKind::Generic,
            Priority::Low,
        );
        assert!(env.can_retry());
        assert_eq!(env.max_retries, 2);
    }
}
