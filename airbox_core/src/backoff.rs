//! Retry and restart policies as explicit state machines.

use std::time::Duration;

/// Delivery retry policy: `base · 2^attempt + U(0, max_jitter)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(250),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn start(&self) -> RetryState {
        RetryState { policy: *self, attempt: 0 }
    }
}

/// Progress through one retry sequence.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    /// Retries consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    ///
    /// `jitter_unit` is a uniform draw in `[0, 1)`.
    pub fn next_delay(&mut self, jitter_unit: f64) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let backoff = self.policy.base * 2u32.saturating_pow(self.attempt);
        let jitter = self.policy.max_jitter.mul_f64(jitter_unit.clamp(0.0, 1.0));
        self.attempt += 1;
        Some(backoff + jitter)
    }
}

/// Runner restart delay: doubles after every failure, capped, reset after success.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
