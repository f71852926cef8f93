//! Policy abstractions for dispatch scheduling.
//!
//! Each policy is a small, pure piece of decision logic the processor
//! consults once per tick or per attempt.
//!
//! - [`RetryPolicy`]: retry budget and backoff
//! - [`RetryAdmissionConfig`]: how many retries may run beside fresh work
//! - [`BatchHold`]: holding and smoothing bulk while realtime work waits

pub mod admission;
pub mod hold;
pub mod retry;

pub use admission::RetryAdmissionConfig;
pub use hold::{BatchHold, BulkBudget, HoldConfig};
pub use retry::RetryPolicy;
