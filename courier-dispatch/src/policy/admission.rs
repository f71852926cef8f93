//! Retry lane admission.
//!
//! Retries share workers with fresh traffic of the same class. While fresh
//! work is waiting, retries are capped to a fraction of the class's capacity
//! so a retry storm cannot starve new submissions; the cap relaxes once the
//! oldest retry has waited long enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAdmissionConfig {
    /// Share of class capacity retries may use while fresh work is pending.
    ///
    /// Default: 30
    #[serde(default = "defaults::cap_percent")]
    pub cap_percent: u32,

    /// Share used instead once the oldest retry has aged past the threshold.
    ///
    /// Default: 70
    #[serde(default = "defaults::aging_relax_percent")]
    pub aging_relax_percent: u32,

    /// How long the oldest retry must wait before the cap relaxes (in milliseconds).
    ///
    /// Default: 30000
    #[serde(default = "defaults::aging_threshold_ms")]
    pub aging_threshold_ms: u64,

    /// Workers kept back from retries for fresh traffic.
    ///
    /// Default: 1
    #[serde(default = "defaults::fresh_reserve")]
    pub fresh_reserve: usize,
}

impl Default for RetryAdmissionConfig {
    fn default() -> Self {
        Self {
            cap_percent: defaults::cap_percent(),
            aging_relax_percent: defaults::aging_relax_percent(),
            aging_threshold_ms: defaults::aging_threshold_ms(),
            fresh_reserve: defaults::fresh_reserve(),
        }
    }
}

impl RetryAdmissionConfig {
    /// Maximum number of in-flight retries for a class.
    ///
    /// `capacity` is the worker count not taken by the other class,
    /// `oldest_retry_wait` how long the head of the retry lane has waited.
    /// Any non-zero capacity admits at least one retry.
    #[must_use]
    pub fn retry_limit(
        &self,
        capacity: usize,
        fresh_pending: bool,
        oldest_retry_wait: Option<Duration>,
    ) -> usize {
        if capacity == 0 {
            return 0;
        }

        let reserved = capacity.saturating_sub(self.fresh_reserve);

        let limit = if fresh_pending {
            let aged = oldest_retry_wait
                .is_some_and(|waited| waited >= Duration::from_millis(self.aging_threshold_ms));
            let percent = if aged {
                self.aging_relax_percent
            } else {
                self.cap_percent
            };
            (capacity * percent as usize / 100).min(reserved)
        } else {
            reserved
        };

        limit.max(1)
    }

    /// Whether one more retry of a class may start.
    #[must_use]
    pub fn admits(
        &self,
        retries_in_flight: usize,
        capacity: usize,
        fresh_pending: bool,
        oldest_retry_wait: Option<Duration>,
    ) -> bool {
        retries_in_flight < self.retry_limit(capacity, fresh_pending, oldest_retry_wait)
    }
}

mod defaults {
    pub const fn cap_percent() -> u32 {
        30
    }

    pub const fn aging_relax_percent() -> u32 {
        70
    }

    pub const fn aging_threshold_ms() -> u64 {
        30_000
    }

    pub const fn fresh_reserve() -> usize {
        1
    }
}
