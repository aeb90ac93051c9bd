use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out")]
    Timeout,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("encryption error: {0}")]
    Encryption(String),
}

impl StoreError {
    /// Faults the resilience wrapper retries: transport-style unavailability
    /// and timeouts (§9/§11 "fixed fault list"). Everything else (codec,
    /// encryption, circuit-open) is returned immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
