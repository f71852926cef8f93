//! One scheduling tick
//!
//! Each tick decides how much bulk traffic may go out, then pulls batches in
//! lane priority order until the pool is full, the queue has nothing
//! dispatchable left, or the per-tick cap is reached.

use courier_common::tracing;
use tokio::time::Instant;

use crate::{
    policy::BulkBudget,
    processor::DispatchProcessor,
    queue::DomainSet,
    task::BatchTask,
    types::{Lane, TrafficClass},
};

/// What one tick did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Batches handed to a worker
    pub dispatched: usize,
    /// Batches failed because their runner was stale or aborted
    pub dropped: usize,
    /// Batches that found no resources and were sent back to wait
    pub deferred: usize,
}

impl CycleReport {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.dropped == 0 && self.deferred == 0
    }
}

impl DispatchProcessor {
    /// Run a single scheduling tick
    #[tracing::instrument(level = "trace", skip_all)]
    ///
    /// Concurrent callers are serialised.
    pub async fn run_cycle(&self) -> CycleReport {
        let _tick = self.tick.lock().await;
        let mut report = CycleReport::default();
        let mut no_slot = DomainSet::default();

        let max_workers = self.pool.max_workers();
        let realtime_pending = self.queue.has_available(Lane::RealtimeFresh, &no_slot);
        let bulk = self.runtime.hold().bulk_budget(
            Instant::now().into_std(),
            realtime_pending,
            &self.config.hold,
            self.config.hold.max_hold(self.config.workers.tick_interval()),
            max_workers,
        );
        let cap = self.config.workers.max_dispatch_per_tick.unwrap_or(usize::MAX);
        let mut bulk_dispatched = 0;

        while report.dispatched < cap && self.pool.has_capacity() {
            let Some(task) = self.next_task(bulk, bulk_dispatched, &no_slot) else {
                break;
            };

            if let Err(rejected) = self.runners.validate(&task) {
                tracing::debug!(
                    batch = %task.id(),
                    reason = ?rejected.reason,
                    "Dropping batch of an invalid runner"
                );
                self.runtime.fail(task, rejected.cause);
                report.dropped += 1;
                continue;
            }

            let domain = task.domain().clone();
            let class = task.class();

            match self.executor.execute(task) {
                Ok(true) => {
                    report.dispatched += 1;
                    if class == TrafficClass::Bulk {
                        bulk_dispatched += 1;
                    }
                }
                Ok(false) => {
                    no_slot.insert(domain);
                    report.deferred += 1;
                }
                Err(e) => {
                    tracing::warn!(domain = %domain, "Stopping dispatch for this tick: {e}");
                    break;
                }
            }
        }

        report
    }

    /// Poll the highest-priority lane that may dispatch right now
    fn next_task(
        &self,
        bulk: BulkBudget,
        bulk_dispatched: usize,
        excluded: &DomainSet,
    ) -> Option<BatchTask> {
        Lane::PRIORITY.into_iter().find_map(|lane| {
            if lane.class() == TrafficClass::Bulk && !bulk.allows(bulk_dispatched) {
                return None;
            }
            if lane.is_retry() && !self.retry_admits(lane, excluded) {
                return None;
            }
            self.queue.poll(lane, excluded)
        })
    }

    fn retry_admits(&self, lane: Lane, excluded: &DomainSet) -> bool {
        let class = lane.class();
        let capacity = self
            .pool
            .max_workers()
            .saturating_sub(self.runtime.in_flight_class(class.other()));
        let fresh_pending = self.queue.has_available(class.fresh_lane(), excluded);
        let oldest_wait = self
            .queue
            .oldest_enqueued_at(lane, excluded)
            .and_then(|at| (self.runtime.clock().now() - at).to_std().ok());

        self.config.retry_admission.admits(
            self.runtime.in_flight(lane),
            capacity,
            fresh_pending,
            oldest_wait,
        )
    }
}
