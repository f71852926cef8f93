//! Lane queues
//!
//! Four lanes (realtime/bulk × fresh/retry), each holding one FIFO per
//! destination domain plus a ring of domains with queued work. Polling a lane
//! serves the ring round-robin, so one busy domain cannot starve the others,
//! and skips domains the caller has excluded for this tick.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use courier_common::{Domain, SharedClock, clock};
use parking_lot::Mutex;

use crate::{
    task::BatchTask,
    types::{Lane, RunnerId, RunnerToken},
};

/// Domains to skip when polling
pub type DomainSet = AHashSet<Domain>;

#[derive(Debug, Default)]
struct LaneState {
    queues: AHashMap<Domain, VecDeque<BatchTask>>,
    /// Domains with queued work, in service order
    ring: VecDeque<Domain>,
    len: usize,
}

impl LaneState {
    fn push(&mut self, task: BatchTask) {
        let domain = task.domain().clone();
        let queue = self.queues.entry(domain.clone()).or_default();
        if queue.is_empty() {
            self.ring.push_back(domain);
        }
        queue.push_back(task);
        self.len += 1;
    }

    fn first_eligible(&self, excluded: &DomainSet) -> Option<usize> {
        self.ring.iter().position(|domain| !excluded.contains(domain))
    }

    fn pop(&mut self, excluded: &DomainSet) -> Option<BatchTask> {
        let position = self.first_eligible(excluded)?;
        let domain = self.ring.remove(position)?;
        let queue = self.queues.get_mut(&domain)?;
        let task = queue.pop_front()?;
        self.len -= 1;

        if queue.is_empty() {
            self.queues.remove(&domain);
        } else {
            self.ring.push_back(domain);
        }

        Some(task)
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&BatchTask) -> bool) -> Vec<BatchTask> {
        let mut removed = Vec::new();

        for queue in self.queues.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for task in queue.drain(..) {
                if predicate(&task) {
                    removed.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            *queue = kept;
        }

        if !removed.is_empty() {
            self.queues.retain(|_, queue| !queue.is_empty());
            let queues = &self.queues;
            self.ring.retain(|domain| queues.contains_key(domain));
            self.len -= removed.len();
        }

        removed
    }
}

/// Queued batches across all four lanes
#[derive(Debug)]
pub struct LaneQueue {
    lanes: [Mutex<LaneState>; 4],
    clock: SharedClock,
}

impl Default for LaneQueue {
    fn default() -> Self {
        Self::new(clock::system())
    }
}

impl LaneQueue {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            lanes: std::array::from_fn(|_| Mutex::new(LaneState::default())),
            clock,
        }
    }

    fn lane(&self, lane: Lane) -> &Mutex<LaneState> {
        &self.lanes[lane.index()]
    }

    /// Append a task to the back of its domain's queue in its lane
    pub fn offer(&self, mut task: BatchTask) {
        task.enqueued_at = self.clock.now();
        let lane = task.lane();

        let depth = {
            let mut state = self.lane(lane).lock();
            state.push(task);
            state.len
        };
        publish_depth(lane, depth);
    }

    /// Take the next task from `lane`, skipping excluded domains
    pub fn poll(&self, lane: Lane, excluded: &DomainSet) -> Option<BatchTask> {
        let (task, depth) = {
            let mut state = self.lane(lane).lock();
            let task = state.pop(excluded)?;
            (task, state.len)
        };
        publish_depth(lane, depth);
        Some(task)
    }

    /// Take the next task from the highest-priority lane that has one
    pub fn poll_any(&self, excluded: &DomainSet) -> Option<BatchTask> {
        Lane::PRIORITY
            .iter()
            .find_map(|lane| self.poll(*lane, excluded))
    }

    /// Whether `lane` has a task for a domain outside `excluded`
    #[must_use]
    pub fn has_available(&self, lane: Lane, excluded: &DomainSet) -> bool {
        self.lane(lane).lock().first_eligible(excluded).is_some()
    }

    /// Enqueue time of the oldest task `poll` could return next from `lane`
    #[must_use]
    pub fn oldest_enqueued_at(&self, lane: Lane, excluded: &DomainSet) -> Option<DateTime<Utc>> {
        let state = self.lane(lane).lock();
        state
            .ring
            .iter()
            .filter(|domain| !excluded.contains(*domain))
            .filter_map(|domain| state.queues.get(domain)?.front())
            .map(BatchTask::enqueued_at)
            .min()
    }

    /// Remove every queued task owned by `runner`.
    ///
    /// With a token, only tasks stamped with that token are removed.
    pub fn remove_by_runner(
        &self,
        runner: &RunnerId,
        token: Option<RunnerToken>,
    ) -> Vec<BatchTask> {
        self.remove_where(|task| {
            task.runner().is_some_and(|r| {
                &r.id == runner && token.is_none_or(|token| r.token == token)
            })
        })
    }

    /// Remove every queued task matching `predicate`
    pub fn remove_where(&self, mut predicate: impl FnMut(&BatchTask) -> bool) -> Vec<BatchTask> {
        let mut removed = Vec::new();

        for lane in Lane::PRIORITY {
            let (mut taken, depth) = {
                let mut state = self.lane(lane).lock();
                let taken = state.remove_where(&mut predicate);
                (taken, state.len)
            };
            if !taken.is_empty() {
                publish_depth(lane, depth);
                removed.append(&mut taken);
            }
        }

        removed
    }

    /// Empty every lane
    pub fn drain(&self) -> Vec<BatchTask> {
        self.remove_where(|_| true)
    }

    #[must_use]
    pub fn len(&self, lane: Lane) -> usize {
        self.lane(lane).lock().len
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        Lane::PRIORITY.iter().map(|lane| self.len(*lane)).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Number of queued tasks per domain in `lane`
    #[must_use]
    pub fn domain_depths(&self, lane: Lane) -> Vec<(Domain, usize)> {
        let state = self.lane(lane).lock();
        state
            .ring
            .iter()
            .filter_map(|domain| Some((domain.clone(), state.queues.get(domain)?.len())))
            .collect()
    }
}

fn publish_depth(lane: Lane, depth: usize) {
    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics
            .dispatch
            .set_queue_depth(lane.index(), depth as u64);
    }
}
