//! Circuit breaker state machine guarding a `DataStore` (§9/§11).
//!
//! Unlike a breaker guarding a single outbound HTTP call, a `DataStore` has
//! two failure classes with different blast radii: a failed read just means
//! stale or missing data, but a failed write can leave the backing store
//! holding a half-applied change. [`OperationKind::Write`] failures are
//! weighted higher so a run of write failures trips the breaker sooner than
//! an equal run of read failures, and a write failure while half-open drops
//! straight back to open rather than needing a second failure to confirm it.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Which side of the `DataStore` contract an operation falls on, for the
/// failure-weighting policy described above. `get`/`exists`/`get_batch`/
/// `query` are reads; `set`/`delete`/`set_batch`/`execute` are writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

impl OperationKind {
    /// How many failure-count units one failure of this kind costs.
    fn failure_weight(self) -> u32 {
        match self {
            OperationKind::Read => 1,
            OperationKind::Write => 2,
        }
    }
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
            failure_threshold,
            success_threshold,
            reset_timeout,
        }
    }

    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = *self.last_failure_time.read() {
                    if last_failure.elapsed() >= self.reset_timeout {
                        *self.state.write() = CircuitState::HalfOpen;
                        self.success_count.store(0, Ordering::SeqCst);
                        debug!("datastore circuit breaker transitioning to half-open");
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.success_threshold {
                    *self.state.write() = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::SeqCst);
                    info!(successes = count, "datastore circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, kind: OperationKind) {
        let weight = kind.failure_weight();
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(weight, Ordering::SeqCst) + weight;
                if count >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.last_failure_time.write() = Some(Instant::now());
                    warn!(failures = count, ?kind, "datastore circuit breaker opened");
                }
            }
            CircuitState::HalfOpen if kind == OperationKind::Write => {
                *self.state.write() = CircuitState::Open;
                *self.last_failure_time.write() = Some(Instant::now());
                self.success_count.store(0, Ordering::SeqCst);
                warn!("datastore circuit breaker re-opened on a write failure in half-open state");
            }
            CircuitState::HalfOpen => {
                let count = self.failure_count.fetch_add(weight, Ordering::SeqCst) + weight;
                if count >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.last_failure_time.write() = Some(Instant::now());
                    self.success_count.store(0, Ordering::SeqCst);
                    warn!("datastore circuit breaker re-opened on failure in half-open state");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(OperationKind::Read);
        cb.record_failure(OperationKind::Read);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(OperationKind::Read);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn write_failures_trip_the_breaker_sooner_than_reads() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(1));
        cb.record_failure(OperationKind::Write);
        assert_eq!(cb.failure_count(), 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(OperationKind::Write);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(1));
        cb.record_failure(OperationKind::Read);
        cb.record_failure(OperationKind::Read);
        assert_eq!(cb.failure_count(), 2);
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(10));
        cb.record_failure(OperationKind::Read);
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_write_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(10));
        cb.record_failure(OperationKind::Read);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure(OperationKind::Write);
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
