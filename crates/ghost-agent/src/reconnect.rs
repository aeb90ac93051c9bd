//! Reconnect backoff schedule (§4.4): `delay = min(maxDelay, base * 1.5^attempt * jitter)`,
//! with an extended delay once `maxAttempts` consecutive failures have occurred.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub extended_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &ghost_config::AgentConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(cfg.reconnect_max_delay_ms),
            max_attempts: cfg.reconnect_max_attempts,
            extended_delay: Duration::from_millis(cfg.reconnect_extended_delay_ms),
        }
    }

    /// Compute the delay before the next reconnect attempt, given the
    /// 1-indexed attempt number and the run of consecutive failures so far.
    pub fn delay_for(&self, attempt: u32, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= self.max_attempts {
            return self.extended_delay;
        }
        let jitter = rand::thread_rng().gen_range(0.85..=1.15);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Jitter injected explicitly, for deterministic tests.
    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let scaled = base_ms * 1.5_f64.powi(attempt as i32) * jitter;
        let capped = scaled.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5000),
            max_delay: Duration::from_millis(120_000),
            max_attempts: 5,
            extended_delay: Duration::from_millis(60_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_and_is_capped() {
        let policy = ReconnectPolicy::default();
        let d0 = policy.delay_with_jitter(0, 1.0);
        let d3 = policy.delay_with_jitter(3, 1.0);
        assert_eq!(d0, Duration::from_millis(5000));
        assert!(d3 > d0);
        let huge = policy.delay_with_jitter(50, 1.0);
        assert_eq!(huge, policy.max_delay);
    }

    #[test]
    fn jitter_bounds_are_respected() {
        let policy = ReconnectPolicy::default();
        let low = policy.delay_with_jitter(0, 0.85);
        let high = policy.delay_with_jitter(0, 1.15);
        assert_eq!(low, Duration::from_millis(4250));
        assert_eq!(high, Duration::from_millis(5750));
    }

    #[test]
    fn extended_delay_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        let delay = policy.delay_for(1, 5);
        assert_eq!(delay, policy.extended_delay);
    }
}
