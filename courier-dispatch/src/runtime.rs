//! Shared runtime state
//!
//! In-flight counters per lane, resource-wait start times, the bulk hold
//! state and the statistics every component reports into. Finalising a
//! batch also goes through here so that counters and the caller's handle
//! always agree.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use courier_common::{SharedClock, internal, tracing};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::DispatchError,
    policy::BatchHold,
    stats::{DailyStats, DomainWindow},
    task::BatchTask,
    types::{BatchId, Lane, RunnerId, TrafficClass},
};

/// Samples older than this are dropped from the domain window
const DOMAIN_WINDOW_HORIZON_HOURS: i64 = 1;

#[derive(Debug, Clone)]
struct ResourceWait {
    runner: Option<RunnerId>,
    started: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RuntimeState {
    in_flight: [AtomicUsize; 4],
    waits: DashMap<BatchId, ResourceWait>,
    hold: Mutex<BatchHold>,
    daily: DailyStats,
    domains: DomainWindow,
    clock: SharedClock,
}

impl RuntimeState {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            in_flight: std::array::from_fn(|_| AtomicUsize::new(0)),
            waits: DashMap::new(),
            hold: Mutex::new(BatchHold::default()),
            daily: DailyStats::new(clock.clone()),
            domains: DomainWindow::new(Duration::hours(DOMAIN_WINDOW_HORIZON_HOURS), clock.clone()),
            clock,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn increment_in_flight(&self, lane: Lane) {
        self.in_flight[lane.index()].fetch_add(1, Ordering::AcqRel);
        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.dispatch.record_attempt_started();
        }
    }

    pub fn decrement_in_flight(&self, lane: Lane) {
        let decremented = self.in_flight[lane.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();

        if !decremented {
            return;
        }
        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.dispatch.record_attempt_finished();
        }
    }

    #[must_use]
    pub fn in_flight(&self, lane: Lane) -> usize {
        self.in_flight[lane.index()].load(Ordering::Acquire)
    }

    /// In-flight attempts across both lanes of `class`
    #[must_use]
    pub fn in_flight_class(&self, class: TrafficClass) -> usize {
        self.in_flight(class.fresh_lane()) + self.in_flight(class.retry_lane())
    }

    #[must_use]
    pub fn total_in_flight(&self) -> usize {
        Lane::PRIORITY.iter().map(|lane| self.in_flight(*lane)).sum()
    }

    /// When `task` first found no resources, recording now if this is the first time
    pub fn wait_started(&self, task: &BatchTask) -> DateTime<Utc> {
        self.waits
            .entry(task.id().clone())
            .or_insert_with(|| ResourceWait {
                runner: task.runner_id().cloned(),
                started: self.clock.now(),
            })
            .started
    }

    pub fn clear_wait(&self, batch: &BatchId) {
        self.waits.remove(batch);
    }

    pub fn clear_waits_for_runner(&self, runner: &RunnerId) {
        self.waits
            .retain(|_, wait| wait.runner.as_ref() != Some(runner));
    }

    /// Number of batches currently waiting for resources
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waits.len()
    }

    pub(crate) fn hold(&self) -> MutexGuard<'_, BatchHold> {
        self.hold.lock()
    }

    #[must_use]
    pub const fn daily(&self) -> &DailyStats {
        &self.daily
    }

    #[must_use]
    pub const fn domains(&self) -> &DomainWindow {
        &self.domains
    }

    /// Resolve `task` successfully with its settled results
    pub fn complete(&self, task: BatchTask) {
        self.clear_wait(task.id());
        let id = task.id().clone();
        let class = task.class();

        if task.complete() {
            internal!(level = DEBUG, batch = %id, "Batch completed");
            self.daily.record_completed();
            if let Some(metrics) = courier_metrics::try_metrics() {
                metrics.dispatch.record_batch(class.label(), true);
            }
        }
    }

    /// Resolve `task` with `cause`
    pub fn fail(&self, task: BatchTask, cause: DispatchError) {
        self.clear_wait(task.id());
        let id = task.id().clone();
        let class = task.class();

        let message = cause.to_string();
        if task.fail(cause) {
            tracing::warn!(batch = %id, "Batch failed: {message}");
            self.daily.record_failed();
            if let Some(metrics) = courier_metrics::try_metrics() {
                metrics.dispatch.record_batch(class.label(), false);
            }
        }
    }
}
