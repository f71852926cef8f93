//! Retry scheduling
//!
//! A retry is a new batch derived from the failed one: same domain, runner
//! and completion handle, one more retry on the counter, and queued in the
//! retry lane of its class once the backoff delay has passed.

use std::sync::Arc;

use courier_common::internal;

use crate::{
    policy::RetryPolicy,
    runner::RunnerGuard,
    runtime::RuntimeState,
    task::BatchTask,
    timer::DelayedTasks,
    types::Recipient,
};

#[derive(Debug)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    runners: Arc<RunnerGuard>,
    runtime: Arc<RuntimeState>,
    timers: Arc<DelayedTasks>,
}

impl RetryScheduler {
    #[must_use]
    pub const fn new(
        policy: RetryPolicy,
        runners: Arc<RunnerGuard>,
        runtime: Arc<RuntimeState>,
        timers: Arc<DelayedTasks>,
    ) -> Self {
        Self {
            policy,
            runners,
            runtime,
            timers,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry `recipients` of `task` after the backoff for its next retry
    pub fn schedule(&self, task: BatchTask, recipients: Vec<Recipient>) {
        self.runtime.clear_wait(task.id());

        let recipients = recipients
            .into_iter()
            .map(|mut recipient| {
                recipient.retry_count += 1;
                recipient
            })
            .collect();
        let retry = task.retry(recipients);
        let delay = self.policy.retry_delay(retry.retry_count());

        internal!(
            level = DEBUG,
            batch = %retry.id(),
            domain = %retry.domain(),
            recipients = retry.recipients().len(),
            delay_ms = delay.as_millis(),
            "Scheduling retry"
        );

        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.dispatch.record_retry(retry.lane().label());
        }

        let runners = self.runners.clone();
        self.timers
            .schedule(delay, retry, move |retry| runners.requeue(retry));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_common::{Domain, ManualClock};

    use super::*;
    use crate::{
        queue::{DomainSet, LaneQueue},
        types::{BatchId, Lane, MessageContent, TrafficClass},
    };

    fn scheduler(policy: RetryPolicy) -> (RetryScheduler, Arc<LaneQueue>) {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(LaneQueue::new(clock.clone()));
        let runtime = Arc::new(RuntimeState::new(clock));
        let runners = Arc::new(RunnerGuard::new(queue.clone(), runtime.clone()));
        let timers = Arc::new(DelayedTasks::new(runtime.clone()));
        (RetryScheduler::new(policy, runners, runtime, timers), queue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_queued_after_backoff() {
        let (retries, queue) = scheduler(RetryPolicy {
            initial_delay_ms: 1_000,
            ..RetryPolicy::default()
        });
        let (task, mut handle) =
            BatchTask::for_test("b1", "example.com", TrafficClass::Bulk, None);
        let recipients = task.recipients().to_vec();

        retries.schedule(task, recipients);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let Some(retry) = queue.poll(Lane::BulkRetry, &DomainSet::default()) else {
            panic!("retry should be queued");
        };
        assert_eq!(retry.id().as_str(), "b1-retry1");
        assert_eq!(retry.retry_count(), 1);
        assert_eq!(retry.recipients()[0].retry_count, 1);
        assert!(handle.try_outcome().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_given_recipients_are_retried() {
        let (retries, queue) = scheduler(RetryPolicy::default());
        let (task, _handle) = BatchTask::new(
            BatchId::new("b2"),
            Domain::new("example.com"),
            TrafficClass::Realtime,
            vec![
                Recipient::new("ok@example.com"),
                Recipient::new("later@example.com"),
            ],
            MessageContent::default(),
            None,
            None,
        );
        let failed = vec![task.recipients()[1].clone()];

        retries.schedule(task, failed);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let Some(retry) = queue.poll(Lane::RealtimeRetry, &DomainSet::default()) else {
            panic!("retry should be queued");
        };
        assert_eq!(retry.recipients().len(), 1);
        assert_eq!(&*retry.recipients()[0].address, "later@example.com");
    }
}
