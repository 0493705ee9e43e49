//! Exponential backoff with jitter

use rand::Rng;
use router_api::BackoffConfig;
use std::time::Duration;

/// Retry delay generator. Each call to [`Backoff::next_delay`] grows the
/// delay by `multiplier` up to `max`; [`Backoff::reset`] starts over.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_ms as f64;
        let factor = self.config.multiplier.powi(attempt.min(32) as i32);
        let delay_ms = (initial * factor).min(self.config.max_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter <= 0.0 {
            return base;
        }
        // spread within [base * (1 - jitter), base]
        let spread = base.as_secs_f64() * self.config.jitter;
        let offset = rand::thread_rng().gen_range(0.0..=spread);
        Duration::from_secs_f64((base.as_secs_f64() - offset).max(0.0))
    }
}
