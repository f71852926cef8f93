//! Execution of admitted batches
//!
//! The coordinator takes a permit for a batch, runs the send on the worker
//! pool, and hands the result to a completion waiter. The waiter releases
//! the permit, feeds cooldown tracking, persists terminal recipient results
//! and either retries what is left or finalises the batch.

use std::{sync::Arc, time::Instant};

use courier_common::tracing;

use crate::{
    address::AddressLeaseAllocator,
    error::DispatchError,
    permit::{Permit, PermitService, WaitOutcome},
    processor::{RetryScheduler, pool::WorkerPool},
    runner::RunnerGuard,
    runtime::RuntimeState,
    sender::{AttemptOutcome, BatchSender, SendRequest},
    sink,
    task::BatchTask,
};

#[derive(Debug, Clone)]
pub struct ExecutionCoordinator {
    sender: Arc<dyn BatchSender>,
    pool: Arc<WorkerPool>,
    permits: Arc<PermitService>,
    addresses: Arc<AddressLeaseAllocator>,
    runners: Arc<RunnerGuard>,
    retries: Arc<RetryScheduler>,
    runtime: Arc<RuntimeState>,
}

impl ExecutionCoordinator {
    #[must_use]
    pub const fn new(
        sender: Arc<dyn BatchSender>,
        pool: Arc<WorkerPool>,
        permits: Arc<PermitService>,
        addresses: Arc<AddressLeaseAllocator>,
        runners: Arc<RunnerGuard>,
        retries: Arc<RetryScheduler>,
        runtime: Arc<RuntimeState>,
    ) -> Self {
        Self {
            sender,
            pool,
            permits,
            addresses,
            runners,
            retries,
            runtime,
        }
    }

    /// Start `task` on a worker.
    ///
    /// Returns `Ok(false)` if its resources were unavailable; the batch has
    /// then been handed to the resource-wait policy. A batch whose wait ran
    /// out is settled on a waiter, not on the calling tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool refused the send. The batch has
    /// been failed with the same error.
    pub fn execute(&self, task: BatchTask) -> Result<bool, DispatchError> {
        let Some(permit) = self.permits.try_acquire(&task) else {
            if let WaitOutcome::Expired(task) = self.permits.handle_unavailable(task) {
                let permits = self.permits.clone();
                self.pool
                    .spawn_waiter(async move { permits.expire(task).await });
            }
            return Ok(false);
        };

        let lane = task.lane();
        self.runtime.increment_in_flight(lane);

        let request = SendRequest {
            batch_id: task.id().clone(),
            domain: task.domain().clone(),
            recipients: task.recipients().to_vec(),
            content: task.content().clone(),
            source: permit.lease().address(),
        };
        let sender = self.sender.clone();
        let started = Instant::now();

        let result = match self.pool.try_spawn(async move { sender.send(request).await }) {
            Ok(result) => result,
            Err(e) => {
                self.runtime.decrement_in_flight(lane);
                self.permits.release(permit);
                self.runtime.fail(task, e.clone());
                return Err(e);
            }
        };

        self.runners.attempt_started(&task);

        tracing::debug!(
            batch = %task.id(),
            domain = %task.domain(),
            lane = %lane,
            source = %permit.lease().address(),
            "Batch dispatched"
        );

        let this = self.clone();
        self.pool.spawn_waiter(async move {
            let outcome = result.await.unwrap_or_else(|_| {
                Err(DispatchError::System(
                    "worker exited without reporting a result".to_string(),
                ))
            });
            let runner = task.runner_id().cloned();
            this.complete(task, permit, outcome, started).await;
            this.runners.attempt_finished(runner.as_ref());
        });

        Ok(true)
    }

    async fn complete(
        &self,
        task: BatchTask,
        permit: Permit,
        outcome: Result<AttemptOutcome, DispatchError>,
        started: Instant,
    ) {
        self.runtime.decrement_in_flight(task.lane());

        let outcome = match outcome {
            Ok(outcome) => {
                self.addresses.record_batch_result(
                    permit.lease(),
                    outcome.status_code(),
                    outcome.had_any_success(),
                );
                self.permits.release(permit);
                outcome
            }
            Err(e) => {
                self.permits.release(permit);
                self.fail_attempt(task, e);
                return;
            }
        };

        self.record_attempt(&task, &outcome, started);

        let can_retry = self.retries.policy().has_budget(task.retry_count());
        let (terminal, retry) = outcome.partition(can_retry);

        if let Err(e) = sink::persist(&task, &terminal).await {
            self.runners.abort_and_fail(task, e.into());
            return;
        }
        task.settle(terminal);

        if let Some(cause) = self.runners.abort_cause(&task) {
            self.runtime.fail(task, cause);
            return;
        }

        if retry.is_empty() {
            self.runtime.complete(task);
        } else {
            self.retries.schedule(task, retry);
        }
    }

    /// The send failed as a whole
    fn fail_attempt(&self, task: BatchTask, error: DispatchError) {
        tracing::warn!(batch = %task.id(), domain = %task.domain(), "Batch attempt failed: {error}");

        if error.is_persistence() {
            self.runners.abort_and_fail(task, error);
        } else if let Some(cause) = self.runners.abort_cause(&task) {
            self.runtime.fail(task, cause);
        } else if error.is_retryable() && self.retries.policy().has_budget(task.retry_count()) {
            let recipients = task.recipients().to_vec();
            self.retries.schedule(task, recipients);
        } else {
            self.runtime.fail(task, error);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn record_attempt(&self, task: &BatchTask, outcome: &AttemptOutcome, started: Instant) {
        let delivered = outcome.delivered();
        let failed = outcome.recipients.len() - delivered;
        let elapsed_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;

        self.runtime.domains().record(
            task.domain(),
            u32::try_from(delivered).unwrap_or(u32::MAX),
            u32::try_from(failed).unwrap_or(u32::MAX),
            elapsed_ms,
        );

        if let Some(metrics) = courier_metrics::try_metrics() {
            let domain = task.domain().as_str();
            metrics
                .dispatch
                .record_recipients_delivered(domain, delivered as u64);
            for recipient in outcome
                .recipients
                .iter()
                .filter(|r| r.disposition != crate::sender::Disposition::Delivered)
            {
                metrics.dispatch.record_recipient_failure(domain, recipient.code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{DispatchEngine, config::DispatchConfig, types::TrafficClass};

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl BatchSender for Unreachable {
        async fn send(&self, _request: SendRequest) -> Result<AttemptOutcome, DispatchError> {
            Err(DispatchError::System("no sends expected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_refused_spawn_reverts_admission() {
        let engine = DispatchEngine::new(DispatchConfig::default(), Arc::new(Unreachable));
        let processor = &engine.processor;
        processor.pool().close();

        let (task, handle) =
            BatchTask::for_test("refused", "example.com", TrafficClass::Realtime, None);
        let lane = task.lane();

        let outcome = processor.executor.execute(task);
        assert!(matches!(outcome, Err(DispatchError::Shutdown)));

        assert_eq!(engine.runtime.in_flight(lane), 0);
        assert_eq!(engine.addresses.active_leases(), 0);
        assert!(matches!(handle.await, Err(DispatchError::Shutdown)));
        assert_eq!(engine.runtime.daily().totals().failed, 1);
    }
}
