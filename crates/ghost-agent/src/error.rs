use ghost_common::GhostError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] GhostError),

    #[error("agent already started")]
    AlreadyStarted,

    #[error("agent is not connected")]
    NotConnected,

    #[error("no fallback transport configured")]
    NoFallback,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
