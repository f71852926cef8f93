//! Retry policy for failed recipients.
//!
//! Decides whether a batch still has retry budget and how long to wait
//! before the next attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (in milliseconds).
    ///
    /// Default: 1000
    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Growth factor applied per additional retry.
    ///
    /// Values below 1.0 are treated as 1.0 so delays never shrink.
    ///
    /// Default: 2.0
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,

    /// Upper bound on the retry delay (in milliseconds).
    ///
    /// Default: 300000 (5 minutes)
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            initial_delay_ms: defaults::initial_delay_ms(),
            multiplier: defaults::multiplier(),
            max_delay_ms: defaults::max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Whether a batch that has been retried `retry_count` times may be retried again.
    #[must_use]
    pub const fn has_budget(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Whether an attempt at `retry_count` is the last one the budget allows.
    #[must_use]
    pub const fn is_final_attempt(&self, retry_count: u32) -> bool {
        !self.has_budget(retry_count)
    }

    /// Delay before the `retry_count`th retry, in milliseconds.
    ///
    /// The first retry waits `initial_delay_ms`; each later one multiplies
    /// by `multiplier`, capped at `max_delay_ms`. Overflow saturates to the cap.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn compute_retry_delay_millis(&self, retry_count: u32) -> u64 {
        let initial = self.initial_delay_ms.min(self.max_delay_ms);
        if retry_count <= 1 {
            return initial;
        }

        let exponent = (retry_count - 1).min(i32::MAX as u32) as i32;
        let multiplier = self.multiplier.max(1.0);
        let delay = self.initial_delay_ms as f64 * multiplier.powi(exponent);

        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            (delay.max(0.0) as u64).min(self.max_delay_ms)
        }
    }

    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.compute_retry_delay_millis(retry_count))
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn initial_delay_ms() -> u64 {
        1_000
    }

    pub const fn multiplier() -> f64 {
        2.0
    }

    pub const fn max_delay_ms() -> u64 {
        300_000 // 5 minutes
    }
}
