//! Delayed re-enqueue timers
//!
//! Batches waiting on resources or on retry backoff sit in a sleeping tokio
//! task until their delay elapses. Closing the timers fails every batch still
//! asleep with [`DispatchError::Shutdown`].

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinSet};

use crate::{error::DispatchError, runtime::RuntimeState, task::BatchTask};

#[derive(Debug)]
pub struct DelayedTasks {
    tasks: Mutex<JoinSet<()>>,
    closed: watch::Sender<bool>,
    runtime: Arc<RuntimeState>,
}

impl DelayedTasks {
    #[must_use]
    pub fn new(runtime: Arc<RuntimeState>) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            closed: watch::Sender::new(false),
            runtime,
        }
    }

    /// Hand `task` to `fire` once `delay` has elapsed
    pub fn schedule<F>(&self, delay: Duration, task: BatchTask, fire: F)
    where
        F: FnOnce(BatchTask) + Send + 'static,
    {
        if *self.closed.borrow() {
            self.runtime.fail(task, DispatchError::Shutdown);
            return;
        }

        let mut closed = self.closed.subscribe();
        let runtime = self.runtime.clone();

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => fire(task),
                _ = closed.wait_for(|closed| *closed) => runtime.fail(task, DispatchError::Shutdown),
            }
        });
    }

    /// Number of timers not yet fired
    #[must_use]
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Fail every sleeping batch and refuse new timers
    pub async fn close(&self) {
        self.closed.send_replace(true);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
    }
}
