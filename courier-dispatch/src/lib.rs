//! Lane-based dispatch engine for outbound mail batches
//!
//! This crate provides:
//! - A four-lane queue (realtime/bulk, fresh/retry) with round-robin domain fairness
//! - A per-tick scheduler enforcing realtime priority, bulk hold and retry quotas
//! - Resource admission over source-address leases and attachment slots
//! - Exponential-backoff retries sharing one completion handle per batch
//! - Runner tracking so cancelled or failed job runs stop dispatching

pub mod address;
pub mod config;
mod engine;
mod error;
pub mod permit;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod runner;
pub mod runtime;
pub mod sender;
mod service;
pub mod sink;
pub mod slots;
pub mod stats;
mod task;
pub mod timer;
pub mod transport;
mod types;

// Re-export configuration
pub use address::{AddressLease, AddressPoolConfig, AddressStats};
pub use config::{DispatchConfig, WorkerConfig};
pub use permit::ResourceWaitConfig;
pub use policy::{HoldConfig, RetryAdmissionConfig, RetryPolicy};
pub use sender::RecipientPolicy;
pub use slots::SlotConfig;
// Re-export error types
pub use error::{AdmissionError, Admitted, DispatchError, RejectReason, Rejected, TransportError};
// Re-export core types
pub use engine::DispatchEngine;
pub use processor::{CycleReport, DispatchProcessor};
pub use queue::LaneQueue;
pub use service::DispatchQueryService;
pub use task::{BatchHandle, BatchTask};
pub use types::{
    BatchId, BatchResult, BatchSpec, Lane, MessageContent, Recipient, RecipientResult,
    RecipientStatus, Runner, RunnerId, RunnerToken, TrafficClass,
};
// Re-export collaborator interfaces
pub use sender::{AttemptOutcome, BatchSender, Disposition, RecipientOutcome, SendRequest, SessionSender};
pub use sink::{PersistenceError, ProgressRecord, ResultSink};
pub use stats::{DayCounts, DomainSnapshot};
pub use transport::{ClientFactory, EnvelopeStep, ProtocolClient, Response, SessionOpenError};
