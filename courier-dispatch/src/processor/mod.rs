//! Dispatch processor orchestration

pub mod cycle;
pub mod execute;
pub mod pool;
pub mod retry;

use std::sync::Arc;

use courier_common::{Signal, internal, tracing};
use tokio::{
    sync::{Mutex, broadcast},
    time::MissedTickBehavior,
};

pub use cycle::CycleReport;
pub use execute::ExecutionCoordinator;
pub use pool::WorkerPool;
pub use retry::RetryScheduler;

use crate::{
    config::DispatchConfig, error::DispatchError, queue::LaneQueue, runner::RunnerGuard,
    runtime::RuntimeState, timer::DelayedTasks,
};

/// Runs scheduling ticks until told to stop
#[derive(Debug)]
pub struct DispatchProcessor {
    config: DispatchConfig,
    queue: Arc<LaneQueue>,
    runners: Arc<RunnerGuard>,
    runtime: Arc<RuntimeState>,
    pool: Arc<WorkerPool>,
    timers: Arc<DelayedTasks>,
    executor: ExecutionCoordinator,
    /// Held for the length of a tick so ticks never overlap
    tick: Mutex<()>,
}

impl DispatchProcessor {
    #[must_use]
    pub fn new(
        config: DispatchConfig,
        queue: Arc<LaneQueue>,
        runners: Arc<RunnerGuard>,
        runtime: Arc<RuntimeState>,
        pool: Arc<WorkerPool>,
        timers: Arc<DelayedTasks>,
        executor: ExecutionCoordinator,
    ) -> Self {
        Self {
            config,
            queue,
            runners,
            runtime,
            pool,
            timers,
            executor,
            tick: Mutex::new(()),
        }
    }

    /// Run ticks until a shutdown signal arrives, then shut down.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Stop running ticks
    /// 2. Wait for running attempts to finish (bounded by the shutdown timeout)
    /// 3. Fail batches still waiting on timers or in the queue
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            workers = self.pool.max_workers(),
            tick_ms = self.config.workers.tick_interval_ms,
            "Dispatch processor starting"
        );

        let mut ticker = tokio::time::interval(self.config.workers.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick to avoid immediate execution
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if !report.is_idle() {
                        tracing::debug!(
                            dispatched = report.dispatched,
                            dropped = report.dropped,
                            deferred = report.deferred,
                            "Dispatch tick"
                        );
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatch processor received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Dispatch processor shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop taking work and fail everything that has not started.
    ///
    /// Returns the number of queued batches that were failed.
    pub async fn shutdown(&self) -> usize {
        self.pool.close();

        let timeout = self.config.workers.shutdown_timeout();
        if self.pool.drain(timeout).await {
            internal!("All in-flight attempts completed");
        } else {
            tracing::warn!(
                "Shutdown timeout of {}s exceeded, remaining attempts were aborted",
                timeout.as_secs()
            );
        }

        // Retries scheduled by the attempts drained above are failed here
        self.timers.close().await;

        let queued = self.queue.drain();
        let count = queued.len();
        for task in queued {
            self.runtime.fail(task, DispatchError::Shutdown);
        }

        internal!(level = INFO, failed = count, "Dispatch processor shutdown complete");
        count
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}
