//! Exponential backoff shared by the insert retries and the empty-pull wait.

use std::time::Duration;

/// Delay schedule: `base_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`.
///
/// With `jitter` on, each delay is drawn uniformly from the upper half of
/// the nominal value, so concurrent relays do not retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Nominal delay before retry number `attempt` (1-indexed), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64).max(0.0);
        Duration::from_nanos(capped.round() as u64)
    }

    /// Delay to actually wait before retry number `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter {
            return nominal;
        }
        let factor = 0.5 + 0.5 * rand::random::<f64>();
        Duration::from_nanos((nominal.as_nanos() as f64 * factor).round() as u64)
    }
}

/// Stateful wrapper that counts consecutive failures (or empty results).
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    consecutive: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    /// Records one more miss and returns how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        self.policy.next_delay(self.consecutive)
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
