//! Exponential backoff with optional jitter.
//!
//! Shared by the retry executor and by stream reconnection. Pure computation,
//! no I/O and no shared state.

use std::time::Duration;

use rand::Rng;

use crate::client::ClientError;

/// Default jitter fraction applied around the computed delay.
pub const DEFAULT_JITTER: f64 = 0.25;

/// Delay policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Fraction of the delay used as a uniform `±` perturbation; `0.0` disables it.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_delay < self.initial_delay {
            return Err(ClientError::Config(
                "max delay must be >= initial delay".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ClientError::Config(
                "backoff multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ClientError::Config(
                "jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay for `attempt` before jitter, clamped to `max_delay`.
    ///
    /// Attempts `0` and `1` both map to `initial_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        if exponent == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powf(f64::from(exponent));
        let max = self.max_delay.as_secs_f64();
        if !base.is_finite() || base >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(base)
    }

    /// Delay for `attempt` using the thread-local random source.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Delay for `attempt` using a caller-supplied random source.
    pub fn delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_nan() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let jitter = self.jitter.min(1.0);
        let base = base.as_secs_f64();
        let offset = rng.random_range(-jitter..=jitter) * base;
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}
