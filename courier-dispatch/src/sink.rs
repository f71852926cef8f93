//! Progress persistence
//!
//! Every recipient that reaches a terminal state is reported to the batch's
//! [`ResultSink`], if it has one. A sink failure is treated as fatal for the
//! runner that owns the batch.

use std::fmt::Debug;

use async_trait::async_trait;
use courier_common::Domain;
use thiserror::Error;

use crate::{
    task::BatchTask,
    types::{BatchId, RecipientResult, RunnerId},
};

/// A sink could not store a progress record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PersistenceError {
    message: String,
}

impl PersistenceError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One terminal recipient result, with the batch it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    /// The attempt that produced the result
    pub batch_id: BatchId,
    /// The batch as originally submitted
    pub root_id: BatchId,
    pub domain: Domain,
    pub runner: Option<RunnerId>,
    pub result: RecipientResult,
}

/// Destination for per-recipient progress records
#[async_trait]
pub trait ResultSink: Send + Sync + Debug {
    /// Store a record.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the record could not be stored; the
    /// owning runner is aborted in response.
    async fn record(&self, record: ProgressRecord) -> Result<(), PersistenceError>;
}

/// Write `results` to the task's sink, stopping at the first failure
pub(crate) async fn persist(
    task: &BatchTask,
    results: &[RecipientResult],
) -> Result<(), PersistenceError> {
    let Some(sink) = task.sink() else {
        return Ok(());
    };

    for result in results {
        sink.record(ProgressRecord {
            batch_id: task.id().clone(),
            root_id: task.root_id().clone(),
            domain: task.domain().clone(),
            runner: task.runner_id().cloned(),
            result: result.clone(),
        })
        .await?;
    }

    Ok(())
}
