//! Retry-wait delay curve.

use std::time::Duration;

use ferry_config::RetryConfig;

/// Delay applied before a request in retry-wait becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Same delay before every retry.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Delay growing by `multiplier` per consumed retry, capped at `max_delay`.
    #[must_use]
    pub const fn exponential(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Spread each delay by up to `fraction` of itself in either direction.
    #[must_use]
    pub const fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction;
        self
    }

    /// Build from the configuration document.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::exponential(
            Duration::from_millis(config.initial_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }

    /// Delay before retry number `retries_used` (1 for the first retry).
    #[must_use]
    pub fn delay_for(&self, retries_used: u32) -> Duration {
        let exponent = i32::try_from(retries_used.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if scaled.is_finite() && scaled >= 0.0 {
            Duration::from_secs_f64(scaled).min(self.max_delay)
        } else {
            self.max_delay
        };
        if self.jitter <= 0.0 {
            return capped;
        }
        let spread = 1.0 + self.jitter.min(1.0) * rand::random::<f64>().mul_add(2.0, -1.0);
        Duration::from_secs_f64(capped.as_secs_f64() * spread).min(self.max_delay)
    }
}
