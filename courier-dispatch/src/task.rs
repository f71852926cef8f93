//! Queued units of work and their completion plumbing
//!
//! A submitted batch and every retry derived from it share one
//! [`BatchContext`]: the same completion channel, the same result sink and
//! one ledger of settled recipient results. The first attempt to finalise
//! wins; the caller's [`BatchHandle`] resolves exactly once.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use courier_common::Domain;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    error::DispatchError,
    sink::ResultSink,
    types::{
        BatchId, BatchResult, Lane, MessageContent, Recipient, RecipientResult, Runner, RunnerId,
        RunnerToken, TrafficClass,
    },
};

type Completion = oneshot::Sender<Result<BatchResult, DispatchError>>;

/// State shared by a batch and all of its retries
#[derive(Debug)]
pub(crate) struct BatchContext {
    root: BatchId,
    domain: Domain,
    class: TrafficClass,
    content: MessageContent,
    runner: Option<Runner>,
    sink: Option<Arc<dyn ResultSink>>,
    settled: Mutex<Vec<RecipientResult>>,
    completion: Mutex<Option<Completion>>,
}

/// One queued attempt at a batch (the original or a retry)
#[derive(Debug)]
pub struct BatchTask {
    id: BatchId,
    lane: Lane,
    retry_count: u32,
    recipients: Vec<Recipient>,
    pub(crate) enqueued_at: DateTime<Utc>,
    context: Arc<BatchContext>,
}

impl BatchTask {
    pub(crate) fn new(
        id: BatchId,
        domain: Domain,
        class: TrafficClass,
        recipients: Vec<Recipient>,
        content: MessageContent,
        runner: Option<Runner>,
        sink: Option<Arc<dyn ResultSink>>,
    ) -> (Self, BatchHandle) {
        let (tx, rx) = oneshot::channel();

        let context = Arc::new(BatchContext {
            root: id.clone(),
            domain,
            class,
            content,
            runner,
            sink,
            settled: Mutex::new(Vec::new()),
            completion: Mutex::new(Some(tx)),
        });

        let task = Self {
            id: id.clone(),
            lane: class.fresh_lane(),
            retry_count: 0,
            recipients,
            enqueued_at: Utc::now(),
            context,
        };

        (task, BatchHandle { id, rx })
    }

    /// Derive the next retry of this batch for the given recipients
    pub(crate) fn retry(&self, recipients: Vec<Recipient>) -> Self {
        let retry_count = self.retry_count + 1;
        Self {
            id: self.context.root.retry(retry_count),
            lane: self.context.class.retry_lane(),
            retry_count,
            recipients,
            enqueued_at: Utc::now(),
            context: self.context.clone(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &BatchId {
        &self.id
    }

    #[must_use]
    pub fn root_id(&self) -> &BatchId {
        &self.context.root
    }

    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.context.domain
    }

    #[must_use]
    pub const fn lane(&self) -> Lane {
        self.lane
    }

    #[must_use]
    pub fn class(&self) -> TrafficClass {
        self.context.class
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    #[must_use]
    pub fn content(&self) -> &MessageContent {
        &self.context.content
    }

    #[must_use]
    pub fn has_attachment(&self) -> bool {
        self.context.content.has_attachment
    }

    #[must_use]
    pub fn runner(&self) -> Option<&Runner> {
        self.context.runner.as_ref()
    }

    #[must_use]
    pub fn runner_id(&self) -> Option<&RunnerId> {
        self.runner().map(|r| &r.id)
    }

    #[must_use]
    pub fn runner_token(&self) -> Option<RunnerToken> {
        self.runner().map(|r| r.token)
    }

    #[must_use]
    pub fn sink(&self) -> Option<&Arc<dyn ResultSink>> {
        self.context.sink.as_ref()
    }

    #[must_use]
    pub const fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Record terminal recipient results in the shared ledger
    pub(crate) fn settle(&self, results: impl IntoIterator<Item = RecipientResult>) {
        self.context.settled.lock().extend(results);
    }

    /// Resolve the caller's handle with the settled results.
    ///
    /// Returns `false` if the batch was already resolved.
    pub(crate) fn complete(self) -> bool {
        let recipients = std::mem::take(&mut *self.context.settled.lock());
        let result = BatchResult {
            batch_id: self.context.root.clone(),
            domain: self.context.domain.clone(),
            recipients,
        };
        self.resolve(Ok(result))
    }

    /// Resolve the caller's handle with an error.
    ///
    /// Returns `false` if the batch was already resolved.
    pub(crate) fn fail(self, cause: DispatchError) -> bool {
        self.resolve(Err(cause))
    }

    fn resolve(&self, outcome: Result<BatchResult, DispatchError>) -> bool {
        let Some(tx) = self.context.completion.lock().take() else {
            return false;
        };
        // A dropped handle just means nobody is waiting
        let _ = tx.send(outcome);
        true
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        id: &str,
        domain: &str,
        class: TrafficClass,
        runner: Option<Runner>,
    ) -> (Self, BatchHandle) {
        Self::new(
            BatchId::new(id),
            Domain::new(domain),
            class,
            vec![Recipient::new(format!("user@{domain}"))],
            MessageContent::new("sender@example.org", b"hello".to_vec()),
            runner,
            None,
        )
    }
}

/// Caller's handle on a submitted batch
///
/// Resolves once the batch and all its retries are finished. Awaiting it
/// yields the aggregated [`BatchResult`], or the [`DispatchError`] that
/// failed the batch.
#[derive(Debug)]
pub struct BatchHandle {
    id: BatchId,
    rx: oneshot::Receiver<Result<BatchResult, DispatchError>>,
}

impl BatchHandle {
    /// A handle that is already resolved
    pub(crate) fn ready(id: BatchId, outcome: Result<BatchResult, DispatchError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { id, rx }
    }

    #[must_use]
    pub const fn id(&self) -> &BatchId {
        &self.id
    }

    /// Take the outcome if the batch has already resolved
    pub fn try_outcome(&mut self) -> Option<Result<BatchResult, DispatchError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DispatchError::Cancelled)),
        }
    }
}

impl Future for BatchHandle {
    type Output = Result<BatchResult, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(DispatchError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecipientStatus;

    #[tokio::test]
    async fn test_completion_carries_settled_results() {
        let (task, handle) = BatchTask::for_test("b1", "example.com", TrafficClass::Bulk, None);
        let recipient = task.recipients()[0].clone();

        task.settle([RecipientResult::delivered(&recipient, 250, "OK")]);
        assert!(task.complete());

        let result = handle.await.unwrap_or_else(|e| panic!("batch failed: {e}"));
        assert_eq!(result.batch_id.as_str(), "b1");
        assert_eq!(result.delivered(), 1);
        assert_eq!(result.recipients[0].status, RecipientStatus::Delivered);
    }

    #[tokio::test]
    async fn test_retries_share_completion() {
        let (task, mut handle) =
            BatchTask::for_test("b2", "example.com", TrafficClass::Realtime, None);

        let retry = task.retry(task.recipients().to_vec());
        assert_eq!(retry.id().as_str(), "b2-retry1");
        assert_eq!(retry.lane(), Lane::RealtimeRetry);
        assert_eq!(retry.retry_count(), 1);

        let second = retry.retry(retry.recipients().to_vec());
        assert_eq!(second.id().as_str(), "b2-retry2");

        assert!(handle.try_outcome().is_none());
        assert!(second.fail(DispatchError::Shutdown));
        // The original shares the context, so it can no longer resolve
        assert!(!task.complete());

        assert!(matches!(
            handle.try_outcome(),
            Some(Err(DispatchError::Shutdown))
        ));
    }

    #[tokio::test]
    async fn test_dropped_task_cancels_handle() {
        let (task, handle) = BatchTask::for_test("b3", "example.com", TrafficClass::Bulk, None);
        drop(task);

        assert!(matches!(handle.await, Err(DispatchError::Cancelled)));
    }
}
