//! Bounded worker pool
//!
//! Send operations run as tokio tasks gated by a semaphore sized to the
//! configured worker count. Completion waiters run in a separate, unbounded
//! set so that waiting on a result never occupies a worker.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{Semaphore, TryAcquireError, oneshot},
    task::JoinSet,
};

use crate::error::DispatchError;

#[derive(Debug)]
pub struct WorkerPool {
    max_workers: usize,
    permits: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    waiters: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            workers: Mutex::new(JoinSet::new()),
            waiters: Mutex::new(JoinSet::new()),
        }
    }

    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers currently running a send
    #[must_use]
    pub fn active(&self) -> usize {
        self.max_workers
            .saturating_sub(self.permits.available_permits())
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        !self.permits.is_closed() && self.permits.available_permits() > 0
    }

    /// Run `work` on a free worker, returning a receiver for its output.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ResourceExhausted`] if every worker is busy, or
    /// [`DispatchError::Shutdown`] once the pool is closed.
    pub fn try_spawn<F>(&self, work: F) -> Result<oneshot::Receiver<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => DispatchError::Shutdown,
                TryAcquireError::NoPermits => {
                    DispatchError::ResourceExhausted("all workers are busy".to_string())
                }
            })?;

        let (tx, rx) = oneshot::channel();

        let mut workers = self.workers.lock();
        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            let output = work.await;
            drop(permit);
            let _ = tx.send(output);
        });

        Ok(rx)
    }

    /// Run a completion waiter outside the bounded pool
    pub fn spawn_waiter<F>(&self, waiter: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut waiters = self.waiters.lock();
        while waiters.try_join_next().is_some() {}
        waiters.spawn(waiter);
    }

    /// Refuse new work
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait up to `timeout` for running workers and their waiters to finish,
    /// then abort whatever is left.
    ///
    /// Returns `true` if everything finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut workers = std::mem::take(&mut *self.workers.lock());

        let drained = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
            // Waiters may still be spawned by workers finishing above
            loop {
                let mut waiters = std::mem::take(&mut *self.waiters.lock());
                if waiters.is_empty() {
                    break;
                }
                while waiters.join_next().await.is_some() {}
            }
        })
        .await
        .is_ok();

        if !drained {
            workers.abort_all();
            self.waiters.lock().abort_all();
        }

        drained
    }
}
