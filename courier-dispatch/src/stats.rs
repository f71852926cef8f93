//! Dispatch statistics
//!
//! [`DailyStats`] keeps a rolling week of finalised-batch counters keyed by
//! calendar day. [`DomainWindow`] keeps per-attempt samples for each domain
//! so callers can ask how a domain has behaved over a recent window.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use courier_common::{Domain, SharedClock};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Days of history kept, including today
pub const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayCounts {
    pub completed: u64,
    pub failed: u64,
}

/// Completed/failed batch counters for the last [`RETENTION_DAYS`] days
#[derive(Debug)]
pub struct DailyStats {
    days: Mutex<BTreeMap<NaiveDate, DayCounts>>,
    clock: SharedClock,
}

impl DailyStats {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            days: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn with_today<T>(&self, f: impl FnOnce(&mut BTreeMap<NaiveDate, DayCounts>, NaiveDate) -> T) -> T {
        let today = self.clock.now().date_naive();
        let mut days = self.days.lock();

        let oldest = today - Duration::days(RETENTION_DAYS - 1);
        days.retain(|day, _| *day >= oldest);

        f(&mut days, today)
    }

    pub fn record_completed(&self) {
        self.with_today(|days, today| days.entry(today).or_default().completed += 1);
    }

    pub fn record_failed(&self) {
        self.with_today(|days, today| days.entry(today).or_default().failed += 1);
    }

    /// Totals across the retained window
    #[must_use]
    pub fn totals(&self) -> DayCounts {
        self.with_today(|days, _| {
            days.values().fold(DayCounts::default(), |acc, day| DayCounts {
                completed: acc.completed + day.completed,
                failed: acc.failed + day.failed,
            })
        })
    }

    /// Retained days, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<(NaiveDate, DayCounts)> {
        self.with_today(|days, _| days.iter().map(|(day, counts)| (*day, *counts)).collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    delivered: u32,
    failed: u32,
    latency_ms: u64,
}

/// Aggregated attempts for one domain over a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSnapshot {
    pub domain: Domain,
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub mean_latency_ms: u64,
}

/// Trailing per-domain attempt samples
#[derive(Debug)]
pub struct DomainWindow {
    samples: DashMap<Domain, Mutex<VecDeque<Sample>>>,
    horizon: Duration,
    clock: SharedClock,
}

impl DomainWindow {
    /// Keep samples for `horizon`.
    ///
    /// Expired samples are dropped when their domain records again, when a
    /// new domain first records, and on every snapshot. Domains left with no
    /// samples are forgotten.
    #[must_use]
    pub fn new(horizon: Duration, clock: SharedClock) -> Self {
        Self {
            samples: DashMap::new(),
            horizon,
            clock,
        }
    }

    pub fn record(&self, domain: &Domain, delivered: u32, failed: u32, latency_ms: u64) {
        let now = self.clock.now();
        let cutoff = now - self.horizon;
        if !self.samples.contains_key(domain) {
            self.prune(cutoff);
        }

        let entry = self.samples.entry(domain.clone()).or_default();
        let mut samples = entry.lock();

        samples.push_back(Sample {
            at: now,
            delivered,
            failed,
            latency_ms,
        });
        while samples.front().is_some_and(|sample| sample.at < cutoff) {
            samples.pop_front();
        }
    }

    /// Domains currently holding samples
    #[must_use]
    pub fn tracked_domains(&self) -> usize {
        self.samples.len()
    }

    fn prune(&self, cutoff: DateTime<Utc>) {
        self.samples.retain(|_, samples| {
            let samples = samples.get_mut();
            while samples.front().is_some_and(|sample| sample.at < cutoff) {
                samples.pop_front();
            }
            !samples.is_empty()
        });
    }

    /// Per-domain aggregates over the last `window`, busiest first
    #[must_use]
    pub fn snapshot(&self, window: Duration) -> Vec<DomainSnapshot> {
        let now = self.clock.now();
        self.prune(now - self.horizon);
        let cutoff = now - window.min(self.horizon);

        let mut snapshots: Vec<_> = self
            .samples
            .iter()
            .filter_map(|entry| {
                let samples = entry.value().lock();
                let recent: Vec<_> = samples.iter().filter(|s| s.at >= cutoff).collect();
                if recent.is_empty() {
                    return None;
                }

                let attempts = recent.len() as u64;
                let total_latency: u64 = recent.iter().map(|s| s.latency_ms).sum();

                Some(DomainSnapshot {
                    domain: entry.key().clone(),
                    attempts,
                    delivered: recent.iter().map(|s| u64::from(s.delivered)).sum(),
                    failed: recent.iter().map(|s| u64::from(s.failed)).sum(),
                    mean_latency_ms: total_latency / attempts,
                })
            })
            .collect();

        snapshots.sort_by(|a, b| b.attempts.cmp(&a.attempts).then_with(|| a.domain.cmp(&b.domain)));
        snapshots
    }
}
