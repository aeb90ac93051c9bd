//! Daemon-side communication server (C6) and supervisor (C7).
//!
//! `ghostd` composes a [`registry::PeerRegistry`] shared by a
//! [`comm_server::CommunicationServer`] (peer liveness, auto-registration,
//! staleness) and a [`supervisor::Supervisor`] (process lifecycle commands).

pub mod comm_server;
pub mod error;
pub mod registry;
pub mod supervisor;

pub use comm_server::CommunicationServer;
pub use error::{DaemonError, Result};
pub use registry::{PeerRegistry, DAEMON_SELF_ID};
pub use supervisor::Supervisor;
