//! Batch coordination: run a group of writes in one transaction and commit all or nothing.

pub mod aggregator;
pub mod executor;

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::ManageConnection;
use crate::error::TxBatchError;
use crate::pool::ConnectionPool;
use crate::session::TransactionSession;
use crate::task::{TaskError, TaskOutcome, TaskSpec, WriteTask};

pub use aggregator::OutcomeAggregator;
pub use executor::BatchExecutor;

/// When a batch of concurrently dispatched writes decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Decide on the first failure without waiting for the rest.
    FailFast,
    /// Wait for every task before deciding.
    CollectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Committed,
    RolledBack,
}

/// Why a batch was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchError {
    #[error("task {index} (sequence {sequence_number}) failed: {cause}")]
    TaskFailed {
        index: usize,
        sequence_number: i64,
        cause: TaskError,
    },
    #[error("commit rejected: {message}")]
    Commit { message: String },
}

/// Outcome of one batch, reportable by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub policy: Policy,
    pub decision: Decision,
    /// One outcome per task, index-aligned with the input.
    pub outcomes: Vec<TaskOutcome>,
    /// Present iff the batch rolled back.
    pub batch_error: Option<BatchError>,
    /// Indices whose outcome arrived after the decision was taken.
    pub late_outcomes: Vec<usize>,
    pub gathered_at_decision: usize,
    /// Secondary error swallowed while rolling back.
    pub rollback_error: Option<String>,
    pub connection_id: u64,
    pub elapsed: Duration,
}

impl BatchResult {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.decision == Decision::Committed
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    /// Rows the batch made durable: the successful row counts when committed, zero otherwise.
    #[must_use]
    pub fn rows_committed(&self) -> u64 {
        if !self.is_committed() {
            return 0;
        }
        self.outcomes
            .iter()
            .map(|o| match o {
                TaskOutcome::Success { rows_affected, .. } => *rows_affected,
                TaskOutcome::Failure { .. } => 0,
            })
            .sum()
    }
}

/// Check out a session, run `specs` as one transaction under `policy`, and release the
/// connection.
///
/// # Errors
/// Returns `TxBatchError::PoolTimeout` / `TxBatchError::PoolClosed` when no session can be
/// obtained, or the driver's error when the transaction cannot be begun. Task failures never
/// surface here; they are reported in the [`BatchResult`].
#[tracing::instrument(skip(pool, specs), fields(tasks = specs.len()))]
pub async fn run_batch<M: ManageConnection>(
    pool: &ConnectionPool<M>,
    specs: &[TaskSpec],
    policy: Policy,
) -> Result<BatchResult, TxBatchError> {
    let mut session = TransactionSession::open(pool).await?;
    if let Err(err) = session.begin().await {
        tracing::warn!(error = %err, "could not begin transaction");
        session.close().await;
        return Err(err);
    }

    let tasks = specs.iter().cloned().map(WriteTask::new).collect();
    let result = BatchExecutor::new(policy).execute(&session, tasks).await;

    let final_state = session.close().await;
    debug_assert!(final_state.is_terminal());
    Ok(result)
}
