//! Core dispatch types
//!
//! Traffic classes, lanes, runner identity, recipients and the public
//! submission/result shapes.

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use courier_common::Domain;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::sink::ResultSink;

/// Priority class of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    /// Latency-sensitive traffic that pre-empts bulk work
    Realtime,
    /// Throughput traffic that yields to realtime work
    Bulk,
}

impl TrafficClass {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Bulk => "bulk",
        }
    }

    /// The class competing with this one for workers
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Realtime => Self::Bulk,
            Self::Bulk => Self::Realtime,
        }
    }

    #[must_use]
    pub const fn fresh_lane(self) -> Lane {
        match self {
            Self::Realtime => Lane::RealtimeFresh,
            Self::Bulk => Lane::BulkFresh,
        }
    }

    #[must_use]
    pub const fn retry_lane(self) -> Lane {
        match self {
            Self::Realtime => Lane::RealtimeRetry,
            Self::Bulk => Lane::BulkRetry,
        }
    }
}

impl Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One of the four queues a batch can wait in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    RealtimeFresh,
    RealtimeRetry,
    BulkFresh,
    BulkRetry,
}

impl Lane {
    /// Lanes in dispatch priority order
    pub const PRIORITY: [Self; 4] = [
        Self::RealtimeFresh,
        Self::RealtimeRetry,
        Self::BulkFresh,
        Self::BulkRetry,
    ];

    /// The lane a task of `class` belongs in after `retry_count` retries
    #[must_use]
    pub const fn of(class: TrafficClass, retry_count: u32) -> Self {
        if retry_count == 0 {
            class.fresh_lane()
        } else {
            class.retry_lane()
        }
    }

    /// Position in [`Lane::PRIORITY`]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::RealtimeFresh => 0,
            Self::RealtimeRetry => 1,
            Self::BulkFresh => 2,
            Self::BulkRetry => 3,
        }
    }

    #[must_use]
    pub const fn class(self) -> TrafficClass {
        match self {
            Self::RealtimeFresh | Self::RealtimeRetry => TrafficClass::Realtime,
            Self::BulkFresh | Self::BulkRetry => TrafficClass::Bulk,
        }
    }

    #[must_use]
    pub const fn is_retry(self) -> bool {
        matches!(self, Self::RealtimeRetry | Self::BulkRetry)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        courier_metrics::LANES[self.index()]
    }
}

impl Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifier of a job run that owns batches
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerId(Arc<str>);

impl RunnerId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique stamp of one incarnation of a runner
///
/// Re-registering a runner id with a fresh token supersedes every batch
/// stamped with the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerToken(Ulid);

impl RunnerToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for RunnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A runner id paired with the token of the run that created a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Runner {
    pub id: RunnerId,
    pub token: RunnerToken,
}

impl Runner {
    #[must_use]
    pub const fn new(id: RunnerId, token: RunnerToken) -> Self {
        Self { id, token }
    }
}

/// Identifier of a batch or one of its retries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(Arc<str>);

impl BatchId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Identifier of the `attempt`th retry of the batch rooted at `self`
    #[must_use]
    pub fn retry(&self, attempt: u32) -> Self {
        Self(Arc::from(format!("{}-retry{attempt}", self.0)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A recipient address and how many times delivery to it has been retried
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub address: Arc<str>,
    pub retry_count: u32,
}

impl Recipient {
    #[must_use]
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: Arc::from(address.as_ref()),
            retry_count: 0,
        }
    }
}

/// Final state of a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Delivered,
    Failed,
}

/// Terminal result for a single recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientResult {
    pub address: Arc<str>,
    pub status: RecipientStatus,
    /// Status code returned by the remote host (or synthesised locally)
    pub code: u16,
    pub message: String,
    /// Number of retries spent on this recipient
    pub retries: u32,
}

impl RecipientResult {
    #[must_use]
    pub fn delivered(recipient: &Recipient, code: u16, message: impl Into<String>) -> Self {
        Self {
            address: recipient.address.clone(),
            status: RecipientStatus::Delivered,
            code,
            message: message.into(),
            retries: recipient.retry_count,
        }
    }

    #[must_use]
    pub fn failed(recipient: &Recipient, code: u16, message: impl Into<String>) -> Self {
        Self {
            address: recipient.address.clone(),
            status: RecipientStatus::Failed,
            code,
            message: message.into(),
            retries: recipient.retry_count,
        }
    }

    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.status == RecipientStatus::Delivered
    }
}

/// The message being dispatched
///
/// Composing the payload is the caller's concern; the engine only needs to
/// know whether it carries an attachment, which gates slot admission.
#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    pub sender: Arc<str>,
    pub payload: Arc<[u8]>,
    pub has_attachment: bool,
}

impl MessageContent {
    #[must_use]
    pub fn new(sender: impl AsRef<str>, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            sender: Arc::from(sender.as_ref()),
            payload: payload.into(),
            has_attachment: false,
        }
    }

    #[must_use]
    pub const fn with_attachment(mut self, has_attachment: bool) -> Self {
        self.has_attachment = has_attachment;
        self
    }
}

/// A batch submission
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub batch_id: String,
    pub domain: Domain,
    pub recipients: Vec<String>,
    pub class: TrafficClass,
    pub content: MessageContent,
    pub runner: Option<Runner>,
    pub sink: Option<Arc<dyn ResultSink>>,
}

impl BatchSpec {
    #[must_use]
    pub fn new(
        batch_id: impl Into<String>,
        domain: impl Into<Domain>,
        recipients: Vec<String>,
        class: TrafficClass,
        content: MessageContent,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            domain: domain.into(),
            recipients,
            class,
            content,
            runner: None,
            sink: None,
        }
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = Some(runner);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Outcome of a completed batch, aggregated across all retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub domain: Domain,
    pub recipients: Vec<RecipientResult>,
}

impl BatchResult {
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.recipients.iter().filter(|r| r.is_delivered()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.recipients.len() - self.delivered()
    }

    /// Look up the result for a recipient address
    #[must_use]
    pub fn recipient(&self, address: &str) -> Option<&RecipientResult> {
        self.recipients.iter().find(|r| &*r.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_for_class_and_retries() {
        assert_eq!(Lane::of(TrafficClass::Realtime, 0), Lane::RealtimeFresh);
        assert_eq!(Lane::of(TrafficClass::Realtime, 2), Lane::RealtimeRetry);
        assert_eq!(Lane::of(TrafficClass::Bulk, 0), Lane::BulkFresh);
        assert_eq!(Lane::of(TrafficClass::Bulk, 1), Lane::BulkRetry);
    }

    #[test]
    fn test_lane_priority_indices_line_up() {
        for (i, lane) in Lane::PRIORITY.iter().enumerate() {
            assert_eq!(lane.index(), i);
        }
        assert_eq!(Lane::BulkRetry.label(), "bulk_retry");
        assert!(Lane::RealtimeRetry.is_retry());
        assert!(!Lane::BulkFresh.is_retry());
    }

    #[test]
    fn test_retry_batch_ids_derive_from_root() {
        let root = BatchId::new("campaign-42");
        assert_eq!(root.retry(1).as_str(), "campaign-42-retry1");
        assert_eq!(root.retry(3).as_str(), "campaign-42-retry3");
    }

    #[test]
    fn test_runner_tokens_are_unique() {
        assert_ne!(RunnerToken::generate(), RunnerToken::generate());
    }

    #[test]
    fn test_runner_token_survives_ron() {
        let token = RunnerToken::generate();

        let encoded = ron::to_string(&token).expect("Failed to encode token");
        let decoded: RunnerToken = ron::from_str(&encoded).expect("Failed to decode token");

        assert_eq!(decoded, token);
    }
}
