use std::time::Instant;

use futures_util::future::join;
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::driver::ManageConnection;
use crate::session::{SessionState, TransactionSession};
use crate::task::WriteTask;

use super::aggregator::OutcomeAggregator;
use super::{BatchError, BatchResult, Decision, Policy};

/// Runs a list of write tasks inside one open session and ends its transaction.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    policy: Policy,
}

impl BatchExecutor {
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    /// Dispatch every task concurrently against `session`, decide under the policy, then
    /// commit or roll back.
    ///
    /// All task futures are driven to completion before this returns, so nothing is still
    /// in flight on the connection when the caller closes the session. The session must
    /// already be `Active`; tasks run against any other state are aborted.
    pub async fn execute<M: ManageConnection>(
        &self,
        session: &TransactionSession<M>,
        tasks: Vec<WriteTask>,
    ) -> BatchResult {
        let started = Instant::now();
        let sequence_numbers: Vec<i64> = tasks.iter().map(WriteTask::sequence_number).collect();
        let mut aggregator = OutcomeAggregator::new(self.policy, tasks.len());

        let mut pending: FuturesUnordered<_> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| async move { (index, task.run(session).await) })
            .collect();

        while !aggregator.is_ready() {
            let Some((index, outcome)) = pending.next().await else {
                break;
            };
            tracing::debug!(
                index,
                sequence_number = sequence_numbers[index],
                success = outcome.is_success(),
                "task finished"
            );
            aggregator.record(index, outcome);
        }

        let gathered_at_decision = aggregator.gathered();
        let verdict = aggregator.decide();
        let first_failure = aggregator
            .first_failure()
            .map(|(index, cause)| (index, cause.clone()));

        let settle = async {
            match verdict {
                Decision::Committed => match session.commit().await {
                    Ok(()) => (Decision::Committed, None),
                    Err(err) => {
                        tracing::warn!(error = %err, "commit rejected; rolling back");
                        session.rollback().await;
                        let batch_error = BatchError::Commit {
                            message: err.to_string(),
                        };
                        (Decision::RolledBack, Some(batch_error))
                    }
                },
                Decision::RolledBack => {
                    let batch_error = first_failure.map(|(index, cause)| BatchError::TaskFailed {
                        index,
                        sequence_number: sequence_numbers[index],
                        cause,
                    });
                    session.rollback().await;
                    (Decision::RolledBack, batch_error)
                }
            }
        };

        // A task still in flight may hold the session gate mid-statement, so the stragglers
        // keep being polled while the transaction ends. Whatever they run lands before the
        // rollback or is refused after it.
        let drain = async {
            let mut late = Vec::new();
            while let Some(item) = pending.next().await {
                late.push(item);
            }
            late
        };

        let ((decision, batch_error), late) = join(settle, drain).await;
        for (index, outcome) in late {
            tracing::debug!(
                index,
                sequence_number = sequence_numbers[index],
                success = outcome.is_success(),
                "task finished after decision"
            );
            aggregator.record(index, outcome);
        }

        debug_assert!(session.state().is_terminal() || session.state() == SessionState::Idle);
        let (outcomes, late_outcomes) = aggregator.finish();
        let result = BatchResult {
            policy: self.policy,
            decision,
            outcomes,
            batch_error,
            late_outcomes,
            gathered_at_decision,
            rollback_error: session.rollback_error(),
            connection_id: session.connection_id(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            policy = ?self.policy,
            decision = ?result.decision,
            failures = result.failure_count(),
            late = result.late_outcomes.len(),
            "batch finished"
        );
        result
    }
}
