//! Bulk hold and smoothing.
//!
//! While realtime fresh work is waiting, bulk lanes are held back entirely
//! for up to `max_hold`. Once the hold ends (either because the realtime
//! backlog cleared or the hold expired), bulk traffic ramps back up through
//! a few smoothing ticks with a reduced per-tick budget instead of
//! stampeding every free worker at once.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldConfig {
    /// Longest bulk may be held back for realtime work (in milliseconds).
    ///
    /// Default: two dispatch ticks
    #[serde(default)]
    pub max_hold_ms: Option<u64>,

    /// Per-tick bulk budget during smoothing, as a share of the worker pool.
    ///
    /// Default: 20
    #[serde(default = "defaults::smoothing_percent")]
    pub smoothing_percent: u32,

    /// Number of ticks bulk stays smoothed after a hold.
    ///
    /// Default: 5
    #[serde(default = "defaults::smoothing_ticks")]
    pub smoothing_ticks: u32,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            max_hold_ms: None,
            smoothing_percent: defaults::smoothing_percent(),
            smoothing_ticks: defaults::smoothing_ticks(),
        }
    }
}

impl HoldConfig {
    #[must_use]
    pub fn max_hold(&self, tick: Duration) -> Duration {
        self.max_hold_ms
            .map_or_else(|| tick.saturating_mul(2), Duration::from_millis)
    }

    /// Bulk dispatches allowed per smoothing tick for a pool of `max_workers`.
    #[must_use]
    pub fn smoothing_budget(&self, max_workers: usize) -> usize {
        (max_workers * self.smoothing_percent as usize / 100).max(1)
    }
}

/// How many bulk batches one tick may dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkBudget {
    Unlimited,
    Limited(usize),
}

impl BulkBudget {
    /// Whether another bulk batch fits after `dispatched` this tick
    #[must_use]
    pub const fn allows(self, dispatched: usize) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(limit) => dispatched < limit,
        }
    }
}

/// Hold state carried across ticks
#[derive(Debug, Default)]
pub struct BatchHold {
    started: Option<Instant>,
    smoothing_left: u32,
}

impl BatchHold {
    /// Work out this tick's bulk budget.
    pub fn bulk_budget(
        &mut self,
        now: Instant,
        realtime_pending: bool,
        config: &HoldConfig,
        max_hold: Duration,
        max_workers: usize,
    ) -> BulkBudget {
        if realtime_pending {
            let started = *self.started.get_or_insert(now);
            if now.saturating_duration_since(started) < max_hold {
                self.smoothing_left = config.smoothing_ticks;
                return BulkBudget::Limited(0);
            }
        } else if self.started.take().is_some() {
            self.smoothing_left = config.smoothing_ticks;
        }

        if self.smoothing_left > 0 {
            self.smoothing_left -= 1;
            BulkBudget::Limited(config.smoothing_budget(max_workers))
        } else {
            BulkBudget::Unlimited
        }
    }

    #[must_use]
    pub const fn is_holding(&self) -> bool {
        self.started.is_some()
    }
}

mod defaults {
    pub const fn smoothing_percent() -> u32 {
        20
    }

    pub const fn smoothing_ticks() -> u32 {
        5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn test_unlimited_without_realtime_work() {
        let config = HoldConfig::default();
        let mut hold = BatchHold::default();

        let budget = hold.bulk_budget(Instant::now(), false, &config, config.max_hold(TICK), 10);
        assert_eq!(budget, BulkBudget::Unlimited);
        assert!(!hold.is_holding());
    }

    #[test]
    fn test_hold_then_smooth_then_release() {
        let config = HoldConfig::default();
        let max_hold = config.max_hold(TICK);
        let mut hold = BatchHold::default();
        let start = Instant::now();

        assert_eq!(
            hold.bulk_budget(start, true, &config, max_hold, 10),
            BulkBudget::Limited(0)
        );
        assert_eq!(
            hold.bulk_budget(start + TICK, true, &config, max_hold, 10),
            BulkBudget::Limited(0)
        );
        assert!(hold.is_holding());

        // Hold expired while realtime work is still pending
        for tick in 0..config.smoothing_ticks {
            let now = start + max_hold + TICK * tick;
            assert_eq!(
                hold.bulk_budget(now, true, &config, max_hold, 10),
                BulkBudget::Limited(2)
            );
        }
        assert_eq!(
            hold.bulk_budget(start + TICK * 20, true, &config, max_hold, 10),
            BulkBudget::Unlimited
        );
    }

    #[test]
    fn test_smoothing_arms_when_realtime_clears() {
        let config = HoldConfig::default();
        let max_hold = config.max_hold(TICK);
        let mut hold = BatchHold::default();
        let start = Instant::now();

        hold.bulk_budget(start, true, &config, max_hold, 3);

        for _ in 0..config.smoothing_ticks {
            assert_eq!(
                hold.bulk_budget(start + TICK, false, &config, max_hold, 3),
                BulkBudget::Limited(1)
            );
        }
        assert!(!hold.is_holding());
        assert_eq!(
            hold.bulk_budget(start + TICK, false, &config, max_hold, 3),
            BulkBudget::Unlimited
        );
    }

    #[test]
    fn test_explicit_max_hold() {
        let config = HoldConfig {
            max_hold_ms: Some(1_000),
            ..HoldConfig::default()
        };
        assert_eq!(config.max_hold(TICK), Duration::from_secs(1));
        assert_eq!(HoldConfig::default().max_hold(TICK), TICK * 2);
    }

    #[test]
    fn test_budget_allows() {
        assert!(BulkBudget::Unlimited.allows(1_000));
        assert!(BulkBudget::Limited(2).allows(1));
        assert!(!BulkBudget::Limited(2).allows(2));
        assert!(!BulkBudget::Limited(0).allows(0));
    }
}
