//! Retry policy for node actions
//!
//! By default a failing node action fails its step immediately, leaving the
//! run re-invokable from the last committed checkpoint. Attaching a
//! [`RetryPolicy`] via
//! [`CompiledGraph::with_retry_policy`](crate::CompiledGraph::with_retry_policy)
//! re-runs a failing action with exponential backoff before the error
//! propagates.
//!
//! ```rust
//! use flowgraph_core::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_base_delay(Duration::from_millis(50))
//!     .without_jitter();
//! assert_eq!(policy.delay_for(3), Duration::from_millis(200));
//! ```

use rand::Rng;
use std::time::Duration;

/// Exponential backoff applied around individual node actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first execution included
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles per attempt after that
    pub base_delay: Duration,

    /// Ceiling on the computed backoff (jitter excluded)
    pub max_delay: Duration,

    /// Add up to 50% random extra delay to avoid synchronized retries
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default delays
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Override the first retry delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Override the backoff ceiling
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Deterministic delays (useful in tests)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to sleep after attempt number `attempt` (1-based) failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter {
            let cap = backoff.as_millis() as u64 / 2;
            if cap > 0 {
                let extra = rand::thread_rng().gen_range(0..=cap);
                return backoff + Duration::from_millis(extra);
            }
        }
        backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_millis(100))
            .without_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(4))
            .without_jitter();
        assert_eq!(policy.delay_for(8), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_within_half_backoff() {
        let policy = RetryPolicy::new(3).with_base_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX).without_jitter();
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }
}
