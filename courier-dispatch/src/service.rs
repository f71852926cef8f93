//! Read-only status queries
//!
//! Control surfaces and dashboards depend on [`DispatchQueryService`] rather
//! than on [`DispatchEngine`] itself, so they can be tested against a mock.
//! Counts spanning several lanes are read lane by lane and are only
//! eventually consistent; use them for monitoring, not for decisions.

use ahash::AHashMap;
use courier_common::Domain;

use crate::{engine::DispatchEngine, stats::DayCounts, types::Lane};

/// Service trait for querying dispatch state
///
/// # Example
///
/// ```rust,ignore
/// fn backlog(service: &dyn DispatchQueryService) -> usize {
///     service.queued_batches()
/// }
/// ```
pub trait DispatchQueryService: Send + Sync {
    /// Batches waiting in any lane
    fn queued_batches(&self) -> usize;

    /// Batches waiting in `lane`
    fn lane_depth(&self, lane: Lane) -> usize;

    /// Batches waiting per domain, across all lanes
    fn queued_by_domain(&self) -> AHashMap<Domain, usize>;

    /// Completed and failed batches over the retained days
    fn daily_totals(&self) -> DayCounts;

    /// Address leases currently held by running attempts
    fn active_sessions(&self) -> usize;

    /// Attempts running from `lane`
    fn in_flight(&self, lane: Lane) -> usize;

    /// Batches sitting out a resource shortage
    fn waiting_for_resources(&self) -> usize;
}

impl DispatchQueryService for DispatchEngine {
    fn queued_batches(&self) -> usize {
        self.queue.total_len()
    }

    fn lane_depth(&self, lane: Lane) -> usize {
        self.queue.len(lane)
    }

    fn queued_by_domain(&self) -> AHashMap<Domain, usize> {
        let mut depths = AHashMap::new();
        for lane in Lane::PRIORITY {
            for (domain, depth) in self.queue.domain_depths(lane) {
                *depths.entry(domain).or_default() += depth;
            }
        }
        depths
    }

    fn daily_totals(&self) -> DayCounts {
        self.runtime.daily().totals()
    }

    fn active_sessions(&self) -> usize {
        self.addresses.active_leases()
    }

    fn in_flight(&self, lane: Lane) -> usize {
        self.runtime.in_flight(lane)
    }

    fn waiting_for_resources(&self) -> usize {
        self.runtime.waiting()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::DispatchConfig,
        error::DispatchError,
        sender::{AttemptOutcome, BatchSender, SendRequest},
        types::{BatchSpec, MessageContent, TrafficClass},
    };

    #[derive(Debug)]
    struct Idle;

    #[async_trait]
    impl BatchSender for Idle {
        async fn send(&self, _request: SendRequest) -> Result<AttemptOutcome, DispatchError> {
            Ok(AttemptOutcome::default())
        }
    }

    #[tokio::test]
    async fn test_queue_views() {
        let engine = DispatchEngine::new(DispatchConfig::default(), Arc::new(Idle));
        let service: &dyn DispatchQueryService = &engine;

        for (id, domain, class) in [
            ("a", "one.example", TrafficClass::Bulk),
            ("b", "one.example", TrafficClass::Realtime),
            ("c", "two.example", TrafficClass::Bulk),
        ] {
            let spec = BatchSpec::new(
                id,
                domain,
                vec![format!("user@{domain}")],
                class,
                MessageContent::default(),
            );
            let _handle = engine
                .submit_batch(spec)
                .await
                .unwrap_or_else(|e| panic!("submission rejected: {e}"));
        }

        assert_eq!(service.queued_batches(), 3);
        assert_eq!(service.lane_depth(Lane::BulkFresh), 2);
        assert_eq!(service.lane_depth(Lane::RealtimeFresh), 1);
        assert_eq!(service.lane_depth(Lane::BulkRetry), 0);

        let by_domain = service.queued_by_domain();
        assert_eq!(by_domain.get(&Domain::new("one.example")), Some(&2));
        assert_eq!(by_domain.get(&Domain::new("two.example")), Some(&1));

        assert_eq!(service.active_sessions(), 0);
        assert_eq!(service.in_flight(Lane::RealtimeFresh), 0);
        assert_eq!(service.daily_totals(), DayCounts::default());
    }
}
