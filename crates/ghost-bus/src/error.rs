use ghost_common::GhostError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error(transparent)]
    Core(#[from] GhostError),

    #[error("invalid channel pattern {0:?}: {1}")]
    InvalidPattern(String, String),
}

pub type Result<T> = std::result::Result<T, BusError>;
