//! Ghost connection agent (C4) and diagnostics probe (C5).
//!
//! This crate is embedded by a reporting process (or run as the daemon's own
//! self-reporting instance) to maintain a connection to the bus, drain an
//! outbound queue of heartbeats/metrics/commands, and fall back to a direct
//! transport when the bus is unavailable.

pub mod agent;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod metrics_sampler;
pub mod reconnect;
pub mod rpc;

pub use agent::{ConnectionAgent, ConnectionState};
pub use diagnostics::{DiagnosticRequest, DiagnosticResults, DiagnosticsProbe};
pub use error::{AgentError, Result};
pub use lifecycle::AgentLifecycle;
pub use metrics_sampler::CpuSampler;
pub use reconnect::ReconnectPolicy;
pub use rpc::{CommandRequest, FallbackTransport, RpcClient};
