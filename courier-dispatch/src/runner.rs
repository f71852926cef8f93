//! Runner validity and abort tracking
//!
//! A runner is one run of a batch job, identified by a runner id and a token
//! unique to the run. Batches capture both when submitted.
//!
//! ```text
//!  UNREGISTERED ──register(id, t1)──> ACTIVE(t1) ──register(id, t2)──> ACTIVE(t2)
//!                                         │                               (t1 batches stale)
//!                                         └──abort(t1 batch, cause)──> ABORTED(t1, cause)
//! ```
//!
//! Batches without a runner are always valid. An abort record outlives
//! [`RunnerGuard::unregister_runner`] until the run's last running attempt
//! has finished, so that attempt still resolves with the abort cause.

use std::sync::Arc;

use courier_common::{internal, tracing};
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    error::{Admitted, DispatchError, RejectReason, Rejected},
    queue::LaneQueue,
    runtime::RuntimeState,
    task::BatchTask,
    types::{RunnerId, RunnerToken},
};

#[derive(Debug, Clone)]
struct AbortRecord {
    token: RunnerToken,
    cause: DispatchError,
}

#[derive(Debug)]
pub struct RunnerGuard {
    active: DashMap<RunnerId, RunnerToken>,
    aborted: DashMap<RunnerId, AbortRecord>,
    /// Attempts currently running, per runner
    in_flight: DashMap<RunnerId, usize>,
    queue: Arc<LaneQueue>,
    runtime: Arc<RuntimeState>,
}

impl RunnerGuard {
    #[must_use]
    pub fn new(queue: Arc<LaneQueue>, runtime: Arc<RuntimeState>) -> Self {
        Self {
            active: DashMap::new(),
            aborted: DashMap::new(),
            in_flight: DashMap::new(),
            queue,
            runtime,
        }
    }

    /// Mark `token` as the active run of `id`.
    ///
    /// Returns queued batches left over from earlier runs of the same id;
    /// they are no longer in the queue and the caller is expected to fail them.
    pub fn register_runner(&self, id: RunnerId, token: RunnerToken) -> Vec<BatchTask> {
        self.active.insert(id.clone(), token);

        let orphans = self.queue.remove_where(|task| {
            task.runner()
                .is_some_and(|runner| runner.id == id && runner.token != token)
        });

        internal!(
            level = DEBUG,
            runner = %id,
            token = %token,
            orphans = orphans.len(),
            "Registered runner"
        );

        orphans
    }

    /// Forget `id`; its queued batches become stale
    pub fn unregister_runner(&self, id: &RunnerId) {
        self.active.remove(id);
        if !self.in_flight.contains_key(id) {
            self.aborted.remove(id);
        }
        self.runtime.clear_waits_for_runner(id);

        internal!(level = DEBUG, runner = %id, "Unregistered runner");
    }

    #[must_use]
    pub fn is_active(&self, id: &RunnerId, token: RunnerToken) -> bool {
        self.active.get(id).is_some_and(|active| *active == token)
    }

    /// Check that `task` belongs to an active, non-aborted run.
    ///
    /// # Errors
    ///
    /// A [`Rejected`] carrying the error to fail the batch with.
    pub fn validate(&self, task: &BatchTask) -> Result<Admitted, Rejected> {
        let Some(runner) = task.runner() else {
            return Ok(Admitted);
        };

        if let Some(cause) = self.abort_cause(task) {
            return Err(Rejected {
                cause,
                reason: RejectReason::Aborted,
            });
        }

        match self.active.get(&runner.id).map(|active| *active) {
            Some(active) if active == runner.token => Ok(Admitted),
            Some(_) => Err(Rejected {
                cause: DispatchError::RunnerInvalid(format!(
                    "runner {} was superseded by a newer run",
                    runner.id
                )),
                reason: RejectReason::Stale,
            }),
            None => Err(Rejected {
                cause: DispatchError::RunnerInvalid(format!(
                    "runner {} is not registered",
                    runner.id
                )),
                reason: RejectReason::Unregistered,
            }),
        }
    }

    /// The recorded abort cause for `task`'s run, if that run was aborted
    #[must_use]
    pub fn abort_cause(&self, task: &BatchTask) -> Option<DispatchError> {
        let runner = task.runner()?;
        self.aborted
            .get(&runner.id)
            .filter(|record| record.token == runner.token)
            .map(|record| DispatchError::aborted(runner.id.clone(), record.cause.clone()))
    }

    /// Abort the run `failed` belongs to.
    ///
    /// Queued batches of the same run are removed and failed with the abort
    /// cause. Repeating an abort for the same run does nothing. Returns the
    /// number of queued batches failed.
    pub fn abort_runner(&self, failed: &BatchTask, cause: DispatchError) -> usize {
        let Some(runner) = failed.runner() else {
            return 0;
        };

        match self.aborted.entry(runner.id.clone()) {
            Entry::Occupied(record) if record.get().token == runner.token => return 0,
            Entry::Occupied(mut record) => {
                record.insert(AbortRecord {
                    token: runner.token,
                    cause: cause.clone(),
                });
            }
            Entry::Vacant(record) => {
                record.insert(AbortRecord {
                    token: runner.token,
                    cause: cause.clone(),
                });
            }
        }

        let queued = self.queue.remove_by_runner(&runner.id, Some(runner.token));
        let count = queued.len();
        let failure = DispatchError::aborted(runner.id.clone(), cause);
        for task in queued {
            self.runtime.fail(task, failure.clone());
        }
        self.runtime.clear_waits_for_runner(&runner.id);

        tracing::warn!(
            runner = %runner.id,
            batch = %failed.id(),
            cancelled = count,
            "Runner aborted: {failure}"
        );

        count
    }

    /// Note that an attempt of `task`'s run has started
    pub(crate) fn attempt_started(&self, task: &BatchTask) {
        if let Some(id) = task.runner_id() {
            *self.in_flight.entry(id.clone()).or_default() += 1;
        }
    }

    /// Note that an attempt of run `id` has finished.
    ///
    /// The abort record of an unregistered run is dropped with its last
    /// running attempt.
    pub(crate) fn attempt_finished(&self, id: Option<&RunnerId>) {
        let Some(id) = id else {
            return;
        };

        let idle = match self.in_flight.entry(id.clone()) {
            Entry::Occupied(mut count) if *count.get() > 1 => {
                *count.get_mut() -= 1;
                false
            }
            Entry::Occupied(count) => {
                count.remove();
                true
            }
            Entry::Vacant(_) => true,
        };

        if idle && !self.active.contains_key(id) {
            self.aborted.remove(id);
        }
    }

    /// Attempts of run `id` currently running
    #[must_use]
    pub fn running_attempts(&self, id: &RunnerId) -> usize {
        self.in_flight.get(id).map_or(0, |count| *count)
    }

    /// Abort `task`'s run because of `cause`, then fail `task` itself
    pub(crate) fn abort_and_fail(&self, task: BatchTask, cause: DispatchError) {
        self.abort_runner(&task, cause.clone());
        let failure = match task.runner_id() {
            Some(runner) => DispatchError::aborted(runner.clone(), cause),
            None => cause,
        };
        self.runtime.fail(task, failure);
    }

    /// Put `task` back in the queue if its run is still valid, else fail it
    pub(crate) fn requeue(&self, task: BatchTask) {
        match self.validate(&task) {
            Ok(Admitted) => self.queue.offer(task),
            Err(rejected) => self.runtime.fail(task, rejected.cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_common::ManualClock;

    use super::*;
    use crate::{
        queue::DomainSet,
        sink::PersistenceError,
        types::{Runner, TrafficClass},
    };

    fn guard() -> (RunnerGuard, Arc<LaneQueue>) {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(LaneQueue::new(clock.clone()));
        let runtime = Arc::new(RuntimeState::new(clock));
        (RunnerGuard::new(queue.clone(), runtime), queue)
    }

    fn runner(id: &str) -> Runner {
        Runner::new(RunnerId::new(id), RunnerToken::generate())
    }

    #[test]
    fn test_runnerless_batches_are_always_valid() {
        let (guard, _) = guard();
        let (task, _handle) = BatchTask::for_test("b", "example.com", TrafficClass::Realtime, None);

        assert!(guard.validate(&task).is_ok());
        assert_eq!(guard.abort_runner(&task, DispatchError::Shutdown), 0);
        assert!(guard.abort_cause(&task).is_none());
    }

    #[test]
    fn test_validation_states() {
        let (guard, _) = guard();
        let first = runner("job");
        let (task, _handle) =
            BatchTask::for_test("b", "example.com", TrafficClass::Bulk, Some(first.clone()));

        let rejected = guard.validate(&task).err().map(|r| r.reason);
        assert_eq!(rejected, Some(RejectReason::Unregistered));

        guard.register_runner(first.id.clone(), first.token);
        assert!(guard.validate(&task).is_ok());
        assert!(guard.is_active(&first.id, first.token));

        guard.register_runner(first.id.clone(), RunnerToken::generate());
        let rejected = guard.validate(&task).err().map(|r| r.reason);
        assert_eq!(rejected, Some(RejectReason::Stale));

        guard.unregister_runner(&first.id);
        let rejected = guard.validate(&task).err().map(|r| r.reason);
        assert_eq!(rejected, Some(RejectReason::Unregistered));
    }

    #[test]
    fn test_register_reclaims_orphans() {
        let (guard, queue) = guard();
        let old = runner("job");

        guard.register_runner(old.id.clone(), old.token);
        queue.offer(BatchTask::for_test("old", "example.com", TrafficClass::Bulk, Some(old.clone())).0);

        let new_token = RunnerToken::generate();
        let orphans = guard.register_runner(old.id.clone(), new_token);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id().as_str(), "old");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_abort_cascades_to_matching_token_only() {
        let (guard, queue) = guard();
        let first = runner("job");
        let second = Runner::new(first.id.clone(), RunnerToken::generate());

        let (failed, _failed_handle) =
            BatchTask::for_test("failed", "example.com", TrafficClass::Bulk, Some(first.clone()));
        let (same, same_handle) =
            BatchTask::for_test("same", "example.com", TrafficClass::Bulk, Some(first.clone()));
        let (other, mut other_handle) =
            BatchTask::for_test("other", "example.com", TrafficClass::Bulk, Some(second));
        queue.offer(same);
        queue.offer(other);

        let cause = DispatchError::Persistence(PersistenceError::new("sink offline"));
        assert_eq!(guard.abort_runner(&failed, cause.clone()), 1);

        let outcome = same_handle.await;
        assert!(matches!(outcome, Err(ref e) if e.is_persistence()));

        assert_eq!(queue.total_len(), 1);
        assert!(other_handle.try_outcome().is_none());
        let remaining = queue.poll_any(&DomainSet::default());
        assert_eq!(remaining.map(|t| t.id().to_string()), Some("other".to_string()));

        // Repeating the abort is a no-op
        assert_eq!(guard.abort_runner(&failed, cause), 0);
        let rejected = guard.validate(&failed).err().map(|r| r.reason);
        assert_eq!(rejected, Some(RejectReason::Aborted));
    }

    #[tokio::test]
    async fn test_requeue_fails_stale_batches() {
        let (guard, queue) = guard();
        let run = runner("job");
        let (task, handle) =
            BatchTask::for_test("b", "example.com", TrafficClass::Bulk, Some(run));

        guard.requeue(task);
        assert!(queue.is_empty());
        assert!(matches!(handle.await, Err(DispatchError::RunnerInvalid(_))));
    }

    #[test]
    fn test_abort_outlives_unregister_while_attempts_run() {
        let (guard, _) = guard();
        let run = runner("job");
        guard.register_runner(run.id.clone(), run.token);

        let (failed, _failed_handle) =
            BatchTask::for_test("failed", "a.example", TrafficClass::Realtime, Some(run.clone()));
        let (running, _running_handle) =
            BatchTask::for_test("running", "b.example", TrafficClass::Realtime, Some(run.clone()));
        guard.attempt_started(&running);
        assert_eq!(guard.running_attempts(&run.id), 1);

        let cause = DispatchError::Persistence(PersistenceError::new("sink offline"));
        guard.abort_runner(&failed, cause);
        guard.unregister_runner(&run.id);

        // The running attempt still sees why its run was aborted
        let seen = guard.abort_cause(&running);
        assert!(matches!(seen, Some(ref e) if e.is_persistence()));

        guard.attempt_finished(running.runner_id());
        assert_eq!(guard.running_attempts(&run.id), 0);
        assert!(guard.abort_cause(&running).is_none());
    }

    #[test]
    fn test_finished_attempt_keeps_abort_of_registered_runner() {
        let (guard, _) = guard();
        let run = runner("job");
        guard.register_runner(run.id.clone(), run.token);

        let (task, _handle) =
            BatchTask::for_test("b", "example.com", TrafficClass::Bulk, Some(run.clone()));
        guard.attempt_started(&task);
        guard.abort_runner(&task, DispatchError::Shutdown);
        guard.attempt_finished(task.runner_id());

        assert!(guard.abort_cause(&task).is_some());
    }
}
