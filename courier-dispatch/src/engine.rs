//! The dispatch engine
//!
//! Owns every component and wires them together: submissions go into the
//! lane queue, the processor drains it tick by tick, and callers await the
//! [`BatchHandle`] returned at submission.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use courier_common::{SharedClock, Signal, clock, internal, tracing};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    address::{AddressLeaseAllocator, AddressStats},
    config::DispatchConfig,
    error::{AdmissionError, DispatchError},
    permit::PermitService,
    processor::{
        CycleReport, DispatchProcessor, ExecutionCoordinator, RetryScheduler, WorkerPool,
    },
    queue::LaneQueue,
    runner::RunnerGuard,
    runtime::RuntimeState,
    sender::{BatchSender, SessionSender},
    sink,
    slots::SlotGroups,
    stats::DomainSnapshot,
    task::{BatchHandle, BatchTask},
    timer::DelayedTasks,
    transport::ClientFactory,
    types::{BatchId, BatchResult, BatchSpec, Recipient, RecipientResult, RunnerId, RunnerToken},
};

#[derive(Debug)]
pub struct DispatchEngine {
    config: DispatchConfig,
    pub(crate) processor: Arc<DispatchProcessor>,
    pub(crate) queue: Arc<LaneQueue>,
    runners: Arc<RunnerGuard>,
    pub(crate) runtime: Arc<RuntimeState>,
    pub(crate) addresses: Arc<AddressLeaseAllocator>,
    accepting: AtomicBool,
    signal: broadcast::Sender<Signal>,
    serving: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchEngine {
    /// Create an engine sending through `sender`, timed by the system clock
    #[must_use]
    pub fn new(config: DispatchConfig, sender: Arc<dyn BatchSender>) -> Self {
        Self::with_clock(config, sender, clock::system())
    }

    /// Create an engine that opens protocol sessions from `factory`
    #[must_use]
    pub fn with_client_factory(config: DispatchConfig, factory: Arc<dyn ClientFactory>) -> Self {
        let sender = Arc::new(SessionSender::new(factory, config.recipients.clone()));
        Self::new(config, sender)
    }

    #[must_use]
    pub fn with_clock(
        config: DispatchConfig,
        sender: Arc<dyn BatchSender>,
        clock: SharedClock,
    ) -> Self {
        let runtime = Arc::new(RuntimeState::new(clock.clone()));
        let queue = Arc::new(LaneQueue::new(clock.clone()));
        let runners = Arc::new(RunnerGuard::new(queue.clone(), runtime.clone()));
        let timers = Arc::new(DelayedTasks::new(runtime.clone()));
        let retries = Arc::new(RetryScheduler::new(
            config.retry.clone(),
            runners.clone(),
            runtime.clone(),
            timers.clone(),
        ));
        let addresses = Arc::new(AddressLeaseAllocator::new(config.addresses.clone(), clock));
        let permits = Arc::new(PermitService::new(
            Arc::new(SlotGroups::new(&config.slots)),
            addresses.clone(),
            runtime.clone(),
            runners.clone(),
            retries.clone(),
            timers.clone(),
            config.resource_wait.clone(),
            config.retry.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(config.workers.max_workers.max(1)));
        let executor = ExecutionCoordinator::new(
            sender,
            pool.clone(),
            permits,
            addresses.clone(),
            runners.clone(),
            retries,
            runtime.clone(),
        );
        let processor = Arc::new(DispatchProcessor::new(
            config.clone(),
            queue.clone(),
            runners.clone(),
            runtime.clone(),
            pool,
            timers,
            executor,
        ));

        let (signal, _) = broadcast::channel(1);

        Self {
            config,
            processor,
            queue,
            runners,
            runtime,
            addresses,
            accepting: AtomicBool::new(true),
            signal,
            serving: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Queue a batch for dispatch.
    ///
    /// A batch with no recipients resolves immediately with an empty result.
    /// A batch addressed to the invalid-domain sentinel resolves immediately
    /// with every recipient failed; neither is queued.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Admission`] if the submission is malformed or the
    /// engine has been shut down.
    pub async fn submit_batch(&self, spec: BatchSpec) -> Result<BatchHandle, DispatchError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(AdmissionError::NotAccepting.into());
        }
        if spec.batch_id.trim().is_empty() {
            return Err(AdmissionError::EmptyBatchId.into());
        }
        if spec.domain.is_empty() {
            return Err(AdmissionError::EmptyDomain.into());
        }
        if let Some(blank) = spec.recipients.iter().find(|r| r.trim().is_empty()) {
            return Err(AdmissionError::InvalidRecipient(blank.clone()).into());
        }

        let id = BatchId::new(spec.batch_id.trim());

        if spec.recipients.is_empty() {
            internal!(batch = %id, "Empty batch resolved without queueing");
            let result = BatchResult {
                batch_id: id.clone(),
                domain: spec.domain,
                recipients: Vec::new(),
            };
            return Ok(BatchHandle::ready(id, Ok(result)));
        }

        let invalid = spec.domain.is_invalid();
        let (task, handle) = BatchTask::new(
            id,
            spec.domain,
            spec.class,
            spec.recipients.iter().map(Recipient::new).collect(),
            spec.content,
            spec.runner,
            spec.sink,
        );

        if invalid {
            self.reject_invalid_domain(task).await;
        } else {
            internal!(
                level = DEBUG,
                batch = %task.id(),
                domain = %task.domain(),
                lane = %task.lane(),
                recipients = task.recipients().len(),
                "Batch queued"
            );
            self.queue.offer(task);
        }

        Ok(handle)
    }

    async fn reject_invalid_domain(&self, task: BatchTask) {
        let code = self.config.recipients.invalid_domain_code;
        let results: Vec<_> = task
            .recipients()
            .iter()
            .map(|recipient| RecipientResult::failed(recipient, code, "Invalid recipient domain"))
            .collect();

        if let Err(e) = sink::persist(&task, &results).await {
            self.runners.abort_and_fail(task, e.into());
            return;
        }

        task.settle(results);
        self.runtime.complete(task);
    }

    /// Make `token` the active run of `id`.
    ///
    /// Returns batches still queued from earlier runs of `id`; they have been
    /// taken out of the queue and should be handed to [`Self::fail_batch`].
    pub fn register_runner(&self, id: RunnerId, token: RunnerToken) -> Vec<BatchTask> {
        self.runners.register_runner(id, token)
    }

    pub fn unregister_runner(&self, id: &RunnerId) {
        self.runners.unregister_runner(id);
    }

    /// Resolve a batch taken out of the engine with `cause`
    pub fn fail_batch(&self, task: BatchTask, cause: DispatchError) {
        self.runtime.fail(task, cause);
    }

    /// Start the tick loop in the background.
    ///
    /// Does nothing if the loop is already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) {
        let mut serving = self.serving.lock();
        if serving.is_some() {
            return;
        }

        let processor = self.processor.clone();
        let shutdown = self.signal.subscribe();
        *serving = Some(tokio::spawn(async move {
            processor.serve(shutdown).await;
        }));
    }

    /// Run one scheduling tick by hand
    pub async fn run_cycle(&self) -> CycleReport {
        self.processor.run_cycle().await
    }

    /// Stop accepting batches and shut the processor down.
    ///
    /// Running attempts get the configured shutdown timeout to finish; every
    /// batch that has not started is failed with [`DispatchError::Shutdown`].
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        let serving = self.serving.lock().take();
        match serving {
            Some(handle) => {
                let _ = self.signal.send(Signal::Shutdown);
                if let Err(e) = handle.await {
                    tracing::error!("Dispatch processor task failed: {e}");
                }
            }
            None => {
                self.processor.shutdown().await;
            }
        }
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Per-domain activity over the trailing `window`
    #[must_use]
    pub fn domain_snapshot(&self, window: chrono::Duration) -> Vec<DomainSnapshot> {
        self.runtime.domains().snapshot(window)
    }

    #[must_use]
    pub fn address_stats(&self) -> Vec<AddressStats> {
        self.addresses.stats()
    }

    /// Workers currently running a send
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.processor.pool().active()
    }
}
