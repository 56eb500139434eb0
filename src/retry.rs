//! Exponential backoff with jitter.
//!
//! Adapted from the durable-execution crate's reliability module: a small
//! builder-style policy that computes a jittered delay for a given attempt
//! number and knows when to give up. Here it backs the rate-limit retry
//! envelope around activity dispatch (20 attempts, 4s-5min by default) as
//! well as any action's declarative `retry_policy`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// The envelope the design calls out for rate-limit errors.
    pub fn rate_limit_envelope() -> Self {
        Self::new(20, Duration::from_secs(4), Duration::from_secs(300))
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn should_retry(&self, attempt: u32, retryable: bool) -> bool {
        retryable && self.has_attempts_remaining(attempt)
    }

    /// Full jitter: a uniform random delay between zero and the exponential
    /// backoff ceiling for this attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let ceiling_secs = (self.min_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=ceiling_secs.max(self.min_delay.as_secs_f64()));
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(30))
    }
}
