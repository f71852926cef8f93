//! Typed error handling for dispatch operations.
//!
//! Batch-level failures fall into five families:
//! - Admission: the submission itself was malformed and never queued
//! - Resource exhaustion: no address lease or attachment slot within the wait budget
//! - Transport: the protocol session could not be used
//! - Runner invalid: the owning job run was superseded or aborted
//! - Persistence: the result sink failed, which is fatal to the owning runner
//!
//! Per-recipient failures are never errors; they are recorded as
//! [`RecipientResult`](crate::RecipientResult)s and the batch carries on.

use std::sync::Arc;

use thiserror::Error;

use crate::{sink::PersistenceError, transport::SessionOpenError, types::RunnerId};

/// Top-level dispatch error type.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The submission was rejected before it was queued.
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// No address lease or attachment slot became available in time.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The protocol session failed as a whole.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The batch belongs to a runner that is no longer active.
    #[error("Runner invalid: {0}")]
    RunnerInvalid(String),

    /// Writing a progress record failed.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    /// The owning runner was aborted; carries the error that triggered the abort.
    #[error("Runner {runner} aborted: {cause}")]
    Aborted {
        runner: RunnerId,
        cause: Arc<DispatchError>,
    },

    /// The batch was dropped before it could complete (e.g. its worker was aborted).
    #[error("Batch cancelled before completion")]
    Cancelled,

    /// The engine is shutting down and no longer accepts or runs work.
    #[error("Dispatch engine is shutting down")]
    Shutdown,

    /// Internal error.
    #[error("System error: {0}")]
    System(String),
}

/// Reasons a submission is refused before queueing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("batch id must not be empty")]
    EmptyBatchId,

    #[error("destination domain must not be empty")]
    EmptyDomain,

    #[error("recipient {0:?} is not a valid address")]
    InvalidRecipient(String),

    #[error("engine is not accepting submissions")]
    NotAccepting,
}

/// Session-level protocol failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The session could not be opened.
    #[error("Session open failed: {0}")]
    SessionOpen(#[from] SessionOpenError),

    /// The connection broke mid-conversation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The remote host answered with something unparseable.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl DispatchError {
    /// Returns `true` if this error is, or was caused by, a persistence failure.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        match self {
            Self::Persistence(_) => true,
            Self::Aborted { cause, .. } => cause.is_persistence(),
            _ => false,
        }
    }

    /// Returns `true` if a later attempt at the same batch could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Transport(_))
    }

    /// Returns `true` if the batch is dropped for runner reasons and must not be retried.
    #[must_use]
    pub const fn is_runner_invalid(&self) -> bool {
        matches!(self, Self::RunnerInvalid(_) | Self::Aborted { .. })
    }

    /// Wrap `cause` as the abort cause of `runner`.
    #[must_use]
    pub fn aborted(runner: RunnerId, cause: Self) -> Self {
        match cause {
            // Never nest abort causes
            aborted @ Self::Aborted { .. } => aborted,
            cause => Self::Aborted {
                runner,
                cause: Arc::new(cause),
            },
        }
    }
}

/// Why a batch failed runner validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No run is registered under the batch's runner id.
    Unregistered,
    /// A later run with a different token superseded the batch's run.
    Stale,
    /// The batch's run was explicitly aborted.
    Aborted,
}

/// Outcome of a failed validation: what to fail the batch with, and why.
#[derive(Debug, Clone)]
pub struct Rejected {
    pub cause: DispatchError,
    pub reason: RejectReason,
}

/// Marker for a batch that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted;
