use ghost_common::GhostError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] GhostError),

    #[error("unknown process {0}")]
    UnknownProcess(String),

    #[error("conflicting state: {0}")]
    ConflictingState(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl From<ghost_bus::BusError> for DaemonError {
    fn from(e: ghost_bus::BusError) -> Self {
        match e {
            ghost_bus::BusError::Core(core) => DaemonError::Core(core),
            ghost_bus::BusError::InvalidPattern(pattern, msg) => {
                DaemonError::Core(GhostError::MalformedFrame(format!(
                    "invalid channel pattern {pattern:?}: {msg}"
                )))
            }
        }
    }
}
