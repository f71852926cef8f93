//! Resource admission
//!
//! A batch may only start once it holds a [`Permit`]: an address lease and,
//! for attachment-bearing batches of a slot-limited class, an attachment
//! slot. When either is unavailable the batch waits, re-enqueued after a
//! short jittered delay, until a wall-clock timeout measured from the first
//! shortage. After the timeout it falls back to a normal backoff retry, or
//! is failed recipient by recipient once the retry budget is spent.

use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use courier_common::{SharedClock, internal, tracing};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    address::{AddressLease, AddressLeaseAllocator},
    policy::RetryPolicy,
    processor::RetryScheduler,
    runner::RunnerGuard,
    runtime::RuntimeState,
    sink,
    slots::SlotGroups,
    task::BatchTask,
    timer::DelayedTasks,
    types::{RecipientResult, TrafficClass},
};

/// Configuration for batches waiting on resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceWaitConfig {
    /// Longest a batch waits for resources before escalating (in milliseconds)
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Fixed part of the re-enqueue delay (in milliseconds)
    #[serde(default = "defaults::requeue_base_ms")]
    pub requeue_base_ms: u64,

    /// Upper bound of the random part of the re-enqueue delay (in milliseconds)
    #[serde(default = "defaults::requeue_jitter_ms")]
    pub requeue_jitter_ms: u64,

    /// Status code given to recipients that never got resources
    #[serde(default = "defaults::timeout_code")]
    pub timeout_code: u16,
}

impl Default for ResourceWaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            requeue_base_ms: defaults::requeue_base_ms(),
            requeue_jitter_ms: defaults::requeue_jitter_ms(),
            timeout_code: defaults::timeout_code(),
        }
    }
}

impl ResourceWaitConfig {
    fn timeout(&self) -> TimeDelta {
        i64::try_from(self.timeout_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }

    fn requeue_delay(&self) -> Duration {
        let jitter = if self.requeue_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.requeue_jitter_ms)
        };
        Duration::from_millis(self.requeue_base_ms.saturating_add(jitter))
    }
}

mod defaults {
    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn requeue_base_ms() -> u64 {
        200
    }

    pub const fn requeue_jitter_ms() -> u64 {
        300
    }

    pub const fn timeout_code() -> u16 {
        451
    }
}

/// Resources held by one running attempt
#[derive(Debug)]
pub struct Permit {
    lease: AddressLease,
    slot: Option<TrafficClass>,
}

impl Permit {
    #[must_use]
    pub const fn lease(&self) -> &AddressLease {
        &self.lease
    }

    #[must_use]
    pub const fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }
}

/// What became of a batch that could not get resources
#[derive(Debug)]
pub enum WaitOutcome {
    /// Put back in its lane after the given delay
    Requeued(Duration),
    /// Waited too long; handed to the retry scheduler
    Retried,
    /// Waited too long with no retry budget left.
    ///
    /// The batch is handed back untouched and must be passed to
    /// [`PermitService::expire`].
    Expired(BatchTask),
}

#[derive(Debug)]
pub struct PermitService {
    slots: Arc<SlotGroups>,
    addresses: Arc<AddressLeaseAllocator>,
    runtime: Arc<RuntimeState>,
    runners: Arc<RunnerGuard>,
    retries: Arc<RetryScheduler>,
    timers: Arc<DelayedTasks>,
    config: ResourceWaitConfig,
    retry_policy: RetryPolicy,
    clock: SharedClock,
}

impl PermitService {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slots: Arc<SlotGroups>,
        addresses: Arc<AddressLeaseAllocator>,
        runtime: Arc<RuntimeState>,
        runners: Arc<RunnerGuard>,
        retries: Arc<RetryScheduler>,
        timers: Arc<DelayedTasks>,
        config: ResourceWaitConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        let clock = runtime.clock().clone();
        Self {
            slots,
            addresses,
            runtime,
            runners,
            retries,
            timers,
            config,
            retry_policy,
            clock,
        }
    }

    /// Take every resource `task` needs, or nothing at all
    #[must_use]
    pub fn try_acquire(&self, task: &BatchTask) -> Option<Permit> {
        let class = task.class();
        let slot = if task.has_attachment() && self.slots.is_limited(class) {
            if !self.slots.try_acquire(class) {
                internal!(domain = %task.domain(), class = %class, "No attachment slot free");
                return None;
            }
            Some(class)
        } else {
            None
        };

        let Some(lease) = self.addresses.try_acquire(task.domain()) else {
            if let Some(class) = slot {
                self.slots.release(class);
            }
            internal!(domain = %task.domain(), "No source address available");
            return None;
        };

        self.runtime.clear_wait(task.id());
        Some(Permit { lease, slot })
    }

    /// Hand back everything `permit` holds
    pub fn release(&self, permit: Permit) {
        self.addresses.release(permit.lease);
        if let Some(class) = permit.slot {
            self.slots.release(class);
        }
    }

    /// Decide what to do with a batch that could not get a permit.
    ///
    /// Persisting the results of an expired batch is left to [`Self::expire`].
    pub fn handle_unavailable(&self, task: BatchTask) -> WaitOutcome {
        let started = self.runtime.wait_started(&task);
        let waited = self.clock.now() - started;

        if waited < self.config.timeout() {
            let delay = self.config.requeue_delay();
            let runners = self.runners.clone();
            self.timers
                .schedule(delay, task, move |task| runners.requeue(task));
            return WaitOutcome::Requeued(delay);
        }

        self.runtime.clear_wait(task.id());

        if self.retry_policy.has_budget(task.retry_count()) {
            tracing::debug!(
                batch = %task.id(),
                domain = %task.domain(),
                waited_ms = waited.num_milliseconds(),
                "Resource wait timed out, retrying with backoff"
            );
            let recipients = task.recipients().to_vec();
            self.retries.schedule(task, recipients);
            return WaitOutcome::Retried;
        }

        WaitOutcome::Expired(task)
    }

    /// Fail every recipient of a batch whose resource wait ran out
    pub async fn expire(&self, task: BatchTask) {
        let message = format!(
            "No sending resources became available within {}ms",
            self.config.timeout_ms
        );
        let results: Vec<_> = task
            .recipients()
            .iter()
            .map(|recipient| {
                RecipientResult::failed(recipient, self.config.timeout_code, message.as_str())
            })
            .collect();

        tracing::warn!(
            batch = %task.id(),
            domain = %task.domain(),
            recipients = results.len(),
            "Resource wait timed out with no retries left"
        );

        if let Err(e) = sink::persist(&task, &results).await {
            self.runners.abort_and_fail(task, e.into());
            return;
        }

        if let Some(metrics) = courier_metrics::try_metrics() {
            for _ in &results {
                metrics
                    .dispatch
                    .record_recipient_failure(task.domain().as_str(), self.config.timeout_code);
            }
        }

        task.settle(results);
        self.runtime.complete(task);
    }
}

#[cfg(test)]
mod tests {
    use courier_common::{Domain, ManualClock};

    use super::*;
    use crate::{
        address::AddressPoolConfig,
        queue::LaneQueue,
        slots::SlotConfig,
        task::BatchHandle,
        types::{BatchId, Lane, MessageContent, Recipient},
    };

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<LaneQueue>,
        slots: Arc<SlotGroups>,
        addresses: Arc<AddressLeaseAllocator>,
        permits: PermitService,
    }

    fn fixture(wait: ResourceWaitConfig, retry: RetryPolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(LaneQueue::new(clock.clone()));
        let runtime = Arc::new(RuntimeState::new(clock.clone()));
        let runners = Arc::new(RunnerGuard::new(queue.clone(), runtime.clone()));
        let timers = Arc::new(DelayedTasks::new(runtime.clone()));
        let retries = Arc::new(RetryScheduler::new(
            retry.clone(),
            runners.clone(),
            runtime.clone(),
            timers.clone(),
        ));
        let slots = Arc::new(SlotGroups::new(&SlotConfig {
            max_in_flight: 1,
            ..SlotConfig::default()
        }));
        let addresses = Arc::new(AddressLeaseAllocator::new(
            AddressPoolConfig {
                sessions_per_address: 1,
                ..AddressPoolConfig::default()
            },
            clock.clone(),
        ));

        let permits = PermitService::new(
            slots.clone(),
            addresses.clone(),
            runtime,
            runners,
            retries,
            timers,
            wait,
            retry,
        );

        Fixture {
            clock,
            queue,
            slots,
            addresses,
            permits,
        }
    }

    fn attachment_task(id: &str) -> (BatchTask, BatchHandle) {
        BatchTask::new(
            BatchId::new(id),
            Domain::new("example.com"),
            TrafficClass::Bulk,
            vec![Recipient::new("a@example.com"), Recipient::new("b@example.com")],
            MessageContent::new("sender@example.org", b"body".to_vec()).with_attachment(true),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_slot_failure_skips_lease() {
        let f = fixture(ResourceWaitConfig::default(), RetryPolicy::default());
        let (first, _a) = attachment_task("first");
        let (second, _b) = attachment_task("second");

        let permit = f.permits.try_acquire(&first);
        assert!(permit.as_ref().is_some_and(Permit::holds_slot));

        assert!(f.permits.try_acquire(&second).is_none());
        assert_eq!(f.addresses.active_leases(), 1, "no lease taken for the rejected batch");

        if let Some(permit) = permit {
            f.permits.release(permit);
        }
        assert_eq!(f.slots.in_use(TrafficClass::Bulk), 0);
        assert_eq!(f.addresses.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_lease_failure_returns_slot() {
        let f = fixture(ResourceWaitConfig::default(), RetryPolicy::default());
        let (plain, _a) = BatchTask::for_test("plain", "example.com", TrafficClass::Bulk, None);
        let (attached, _b) = attachment_task("attached");

        // Take the only address session for example.com
        let held = f.permits.try_acquire(&plain);
        assert!(held.as_ref().is_some_and(|p| !p.holds_slot()));

        assert!(f.permits.try_acquire(&attached).is_none());
        assert_eq!(f.slots.in_use(TrafficClass::Bulk), 0, "slot handed back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_wait_requeues() {
        let f = fixture(ResourceWaitConfig::default(), RetryPolicy::default());
        let (task, mut handle) =
            BatchTask::for_test("waiting", "example.com", TrafficClass::Bulk, None);

        let outcome = f.permits.handle_unavailable(task);
        let WaitOutcome::Requeued(delay) = outcome else {
            panic!("expected a requeue, got {outcome:?}");
        };
        assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(f.queue.total_len(), 1);
        assert!(handle.try_outcome().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_escalates_to_retry() {
        let f = fixture(ResourceWaitConfig::default(), RetryPolicy::default());
        let (task, _handle) =
            BatchTask::for_test("slow", "example.com", TrafficClass::Realtime, None);
        let (again, _again_handle) =
            BatchTask::for_test("slow", "example.com", TrafficClass::Realtime, None);

        assert!(matches!(
            f.permits.handle_unavailable(task),
            WaitOutcome::Requeued(_)
        ));

        // Same batch id, observed again after the timeout
        f.clock.advance(chrono::Duration::seconds(31));
        assert!(matches!(
            f.permits.handle_unavailable(again),
            WaitOutcome::Retried
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.queue.len(Lane::RealtimeRetry), 1);
    }

    #[tokio::test]
    async fn test_timeout_without_budget_fails_every_recipient() {
        let f = fixture(
            ResourceWaitConfig {
                timeout_ms: 0,
                ..ResourceWaitConfig::default()
            },
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        );
        let (task, mut handle) = attachment_task("doomed");

        let WaitOutcome::Expired(task) = f.permits.handle_unavailable(task) else {
            panic!("expected the wait to expire");
        };
        assert!(handle.try_outcome().is_none(), "nothing settled before expiry");

        f.permits.expire(task).await;

        let result = handle.await.unwrap_or_else(|e| panic!("batch failed: {e}"));
        assert_eq!(result.delivered(), 0);
        assert_eq!(result.failed(), 2);
        assert!(result.recipients.iter().all(|r| r.code == 451));
        assert!(f.queue.is_empty());
    }
}
