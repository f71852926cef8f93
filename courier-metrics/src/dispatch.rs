//! Dispatch engine metrics
//!
//! Tracks outbound batch dispatch including:
//! - Batch outcomes by traffic class
//! - Recipient successes and failures by status code
//! - Retry volume by lane
//! - Protocol response latency by step
//! - Session failures
//! - Queue depth and in-flight attempts per lane

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashSet;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

use crate::MetricsError;

/// Lane labels, in dispatch priority order
pub const LANES: [&str; 4] = ["realtime_fresh", "realtime_retry", "bulk_fresh", "bulk_retry"];

const OTHER_DOMAIN: &str = "other";

/// Dispatch metrics collector
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Total number of finalised batches by outcome and traffic class
    batches_total: Counter<u64>,

    /// Total number of recipients delivered, by domain
    recipients_delivered: Counter<u64>,

    /// Total number of recipients failed, by domain and status code
    recipients_failed: Counter<u64>,

    /// Total number of retry batches scheduled, by lane
    retries_total: Counter<u64>,

    /// Distribution of protocol response latency by step
    response_latency_ms: Histogram<f64>,

    /// Total number of sessions that failed to open or broke mid-batch
    session_failures: Counter<u64>,

    /// Number of attempts currently executing
    in_flight: UpDownCounter<i64>,

    // Local mirrors read by the queue-depth gauge and by tests
    queue_depth: Arc<[AtomicU64; 4]>,
    completed_count: AtomicU64,
    failed_count: AtomicU64,
    retry_count: AtomicU64,
    in_flight_count: AtomicU64,

    max_domain_cardinality: usize,
    high_priority_domains: Vec<String>,
    tracked_domains: DashSet<String>,
}

impl DispatchMetrics {
    /// Create a new dispatch metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new(
        max_domain_cardinality: usize,
        high_priority_domains: Vec<String>,
    ) -> Result<Self, MetricsError> {
        let meter = meter();

        let batches_total = meter
            .u64_counter("courier.dispatch.batches.total")
            .with_description("Total number of finalised batches by outcome")
            .build();

        let recipients_delivered = meter
            .u64_counter("courier.dispatch.recipients.delivered.total")
            .with_description("Total number of recipients delivered successfully")
            .build();

        let recipients_failed = meter
            .u64_counter("courier.dispatch.recipients.failed.total")
            .with_description("Total number of recipient failures by status code")
            .build();

        let retries_total = meter
            .u64_counter("courier.dispatch.retries.total")
            .with_description("Total number of retry batches scheduled")
            .build();

        let response_latency_ms = meter
            .f64_histogram("courier.dispatch.response.latency.ms")
            .with_description("Distribution of protocol response latency by step")
            .build();

        let session_failures = meter
            .u64_counter("courier.dispatch.session.failures.total")
            .with_description("Total number of failed or broken sessions")
            .build();

        let in_flight = meter
            .i64_up_down_counter("courier.dispatch.in_flight")
            .with_description("Number of batch attempts currently executing")
            .build();

        let queue_depth: Arc<[AtomicU64; 4]> = Arc::new(std::array::from_fn(|_| AtomicU64::new(0)));
        let depth = queue_depth.clone();

        // The meter keeps this alive internally via the callback
        meter
            .u64_observable_gauge("courier.dispatch.queue.depth")
            .with_description("Current number of queued batches per lane")
            .with_callback(move |observer| {
                for (lane, count) in LANES.iter().zip(depth.iter()) {
                    observer.observe(
                        count.load(Ordering::Relaxed),
                        &[KeyValue::new("lane", *lane)],
                    );
                }
            })
            .build();

        Ok(Self {
            batches_total,
            recipients_delivered,
            recipients_failed,
            retries_total,
            response_latency_ms,
            session_failures,
            in_flight,
            queue_depth,
            completed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            in_flight_count: AtomicU64::new(0),
            max_domain_cardinality,
            high_priority_domains,
            tracked_domains: DashSet::new(),
        })
    }

    /// Map a domain onto a bounded set of attribute values
    fn domain_label(&self, domain: &str) -> String {
        if self.high_priority_domains.iter().any(|d| d == domain)
            || self.tracked_domains.contains(domain)
        {
            return domain.to_string();
        }

        if self.tracked_domains.len() < self.max_domain_cardinality {
            self.tracked_domains.insert(domain.to_string());
            return domain.to_string();
        }

        OTHER_DOMAIN.to_string()
    }

    /// Record a finalised batch
    pub fn record_batch(&self, class: &'static str, completed: bool) {
        let outcome = if completed { "completed" } else { "failed" };
        self.batches_total.add(
            1,
            &[
                KeyValue::new("outcome", outcome),
                KeyValue::new("class", class),
            ],
        );

        if completed {
            self.completed_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record recipients accepted by the remote host
    pub fn record_recipients_delivered(&self, domain: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.recipients_delivered
            .add(count, &[KeyValue::new("domain", self.domain_label(domain))]);
    }

    /// Record a recipient failure
    pub fn record_recipient_failure(&self, domain: &str, code: u16) {
        self.recipients_failed.add(
            1,
            &[
                KeyValue::new("domain", self.domain_label(domain)),
                KeyValue::new("code", i64::from(code)),
            ],
        );
    }

    /// Record a scheduled retry batch
    pub fn record_retry(&self, lane: &'static str) {
        self.retries_total.add(1, &[KeyValue::new("lane", lane)]);
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latency of one protocol step
    pub fn record_response_latency(&self, step: &'static str, millis: f64) {
        self.response_latency_ms
            .record(millis, &[KeyValue::new("step", step)]);
    }

    /// Record a session that could not be opened or broke mid-batch
    pub fn record_session_failure(&self, domain: &str, code: u16) {
        self.session_failures.add(
            1,
            &[
                KeyValue::new("domain", self.domain_label(domain)),
                KeyValue::new("code", i64::from(code)),
            ],
        );
    }

    pub fn record_attempt_started(&self) {
        self.in_flight.add(1, &[]);
        self.in_flight_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_finished(&self) {
        self.in_flight.add(-1, &[]);
        self.in_flight_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set the queue depth for a lane (index into [`LANES`])
    pub fn set_queue_depth(&self, lane: usize, depth: u64) {
        if let Some(counter) = self.queue_depth.get(lane) {
            counter.store(depth, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn queue_depth(&self, lane: usize) -> u64 {
        self.queue_depth
            .get(lane)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn completed_batches(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_batches(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight_count.load(Ordering::Relaxed)
    }
}

/// Get the OpenTelemetry meter for dispatch metrics
fn meter() -> Meter {
    opentelemetry::global::meter("courier.dispatch")
}
