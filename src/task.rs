use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::{RowValues, Statement};
use crate::error::TxBatchError;

const INSERT_SAMPLE: &str = "INSERT INTO batch_sample \
     (name, amount, sequence_number, latency_ms, created_at) \
     VALUES (?1, ?2, ?3, ?4, ?5)";
const SAMPLE_AMOUNT: i64 = 1000;

/// Anything a write task can send its statement to. Inside a batch this is the session,
/// never a connection the task checked out itself.
#[async_trait]
pub trait StatementTarget: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<u64, TxBatchError>;
}

/// Caller-facing description of one write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub sequence_number: i64,
    #[serde(default)]
    pub simulated_latency: Duration,
    #[serde(default)]
    pub forced_failure_marker: Option<i64>,
}

impl TaskSpec {
    #[must_use]
    pub fn new(sequence_number: i64) -> Self {
        Self {
            sequence_number,
            simulated_latency: Duration::ZERO,
            forced_failure_marker: None,
        }
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = latency;
        self
    }

    #[must_use]
    pub fn failing_at(mut self, marker: Option<i64>) -> Self {
        self.forced_failure_marker = marker;
        self
    }

    /// `count` specs numbered `1..=count`, each sleeping `sequence * latency_step`, all sharing
    /// the same failure marker.
    #[must_use]
    pub fn sequence(count: usize, latency_step: Duration, fail_at: Option<i64>) -> Vec<Self> {
        (1..=count)
            .map(|n| {
                let seq = i64::try_from(n).unwrap_or(i64::MAX);
                let factor = u32::try_from(n).unwrap_or(u32::MAX);
                TaskSpec::new(seq)
                    .with_latency(latency_step.saturating_mul(factor))
                    .failing_at(fail_at)
            })
            .collect()
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// The store rejected the statement.
    Statement,
    /// The task's failure marker matched its sequence number.
    Forced,
    /// The statement exceeded the connection's statement timeout.
    Timeout,
    /// The physical connection failed.
    Connection,
    /// The transaction had already ended; the statement never ran.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    #[must_use]
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&TxBatchError> for TaskError {
    fn from(err: &TxBatchError) -> Self {
        let kind = match err {
            TxBatchError::StatementTimeout(_) => TaskErrorKind::Timeout,
            TxBatchError::ConnectionError(_) => TaskErrorKind::Connection,
            TxBatchError::TransactionState(_) => TaskErrorKind::Aborted,
            _ => TaskErrorKind::Statement,
        };
        TaskError::new(kind, err.to_string())
    }
}

/// Terminal result of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { rows_affected: u64, elapsed: Duration },
    Failure { cause: TaskError, elapsed: Duration },
}

impl TaskOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Failure { cause, .. } => Some(cause),
            TaskOutcome::Success { .. } => None,
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match self {
            TaskOutcome::Success { elapsed, .. } | TaskOutcome::Failure { elapsed, .. } => *elapsed,
        }
    }
}

/// A single immutable write; [`run`](Self::run) consumes it so its outcome is produced once.
#[derive(Debug, Clone)]
pub struct WriteTask {
    spec: TaskSpec,
}

impl WriteTask {
    #[must_use]
    pub fn new(spec: TaskSpec) -> Self {
        Self { spec }
    }

    #[must_use]
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    #[must_use]
    pub fn sequence_number(&self) -> i64 {
        self.spec.sequence_number
    }

    /// True when this task is rigged to fail.
    #[must_use]
    pub fn is_forced_failure(&self) -> bool {
        self.spec.forced_failure_marker == Some(self.spec.sequence_number)
    }

    /// The insert this task issues, derived from its sequence number.
    #[must_use]
    pub fn statement(&self) -> Statement {
        let seq = self.spec.sequence_number;
        let latency_ms = i64::try_from(self.spec.simulated_latency.as_millis()).unwrap_or(i64::MAX);
        Statement::new(
            INSERT_SAMPLE,
            vec![
                RowValues::Text(format!("task-{seq}")),
                RowValues::Int(SAMPLE_AMOUNT),
                RowValues::Int(seq),
                RowValues::Int(latency_ms),
                RowValues::Text(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            ],
        )
        .with_delay(self.spec.simulated_latency)
    }

    /// Issue the statement on `target` and time the call. The simulated latency travels with
    /// the statement, so it is spent holding the connection and shows up in `elapsed`.
    ///
    /// A rigged task fails after its statement was issued; whatever it wrote is left for the
    /// enclosing transaction to undo.
    pub async fn run<T>(self, target: &T) -> TaskOutcome
    where
        T: StatementTarget + ?Sized,
    {
        let started = Instant::now();
        let result = target.execute(&self.statement()).await;
        let elapsed = started.elapsed();

        match result {
            Ok(_) if self.is_forced_failure() => TaskOutcome::Failure {
                cause: TaskError::new(
                    TaskErrorKind::Forced,
                    format!(
                        "forced failure at sequence {}",
                        self.spec.sequence_number
                    ),
                ),
                elapsed,
            },
            Ok(rows_affected) => TaskOutcome::Success {
                rows_affected,
                elapsed,
            },
            Err(err) => TaskOutcome::Failure {
                cause: TaskError::from(&err),
                elapsed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Statement>>,
        reject: bool,
    }

    #[async_trait]
    impl StatementTarget for Recorder {
        async fn execute(&self, statement: &Statement) -> Result<u64, TxBatchError> {
            self.seen.lock().unwrap().push(statement.clone());
            if self.reject {
                Err(TxBatchError::StatementFailure("constraint violated".into()))
            } else {
                Ok(1)
            }
        }
    }

    #[test]
    fn statement_is_built_from_sequence_number() {
        let task = WriteTask::new(TaskSpec::new(4).with_latency(Duration::from_millis(40)));
        let stmt = task.statement();
        assert!(stmt.sql.starts_with("INSERT INTO batch_sample"));
        assert_eq!(stmt.params[0].as_text(), Some("task-4"));
        assert_eq!(stmt.params[2].as_int(), Some(&4));
        assert_eq!(stmt.params[3].as_int(), Some(&40));
        assert_eq!(stmt.delay, Duration::from_millis(40));
    }

    #[test]
    fn sequence_numbers_from_one_with_growing_latency() {
        let specs = TaskSpec::sequence(3, Duration::from_millis(10), Some(2));
        let seqs: Vec<_> = specs.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(specs[2].simulated_latency, Duration::from_millis(30));
        assert!(specs.iter().all(|s| s.forced_failure_marker == Some(2)));
    }

    #[tokio::test]
    async fn forced_failure_still_issues_statement() {
        let target = Recorder::default();
        let outcome = WriteTask::new(TaskSpec::new(3).failing_at(Some(3)))
            .run(&target)
            .await;

        assert_eq!(target.seen.lock().unwrap().len(), 1);
        assert_eq!(outcome.cause().map(|c| c.kind), Some(TaskErrorKind::Forced));
    }

    #[tokio::test]
    async fn marker_for_another_task_does_not_fail() {
        let target = Recorder::default();
        let outcome = WriteTask::new(TaskSpec::new(2).failing_at(Some(3)))
            .run(&target)
            .await;
        assert!(matches!(
            outcome,
            TaskOutcome::Success {
                rows_affected: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn store_errors_become_failure_outcomes() {
        let target = Recorder {
            reject: true,
            ..Recorder::default()
        };
        let outcome = WriteTask::new(TaskSpec::new(1)).run(&target).await;
        let cause = outcome.cause().unwrap();
        assert_eq!(cause.kind, TaskErrorKind::Statement);
        assert!(cause.message.contains("constraint violated"));
    }

    #[test]
    fn error_kinds_map_from_driver_errors() {
        let timeout = TaskError::from(&TxBatchError::StatementTimeout(Duration::from_secs(1)));
        assert_eq!(timeout.kind, TaskErrorKind::Timeout);
        let aborted = TaskError::from(&TxBatchError::TransactionState("done".into()));
        assert_eq!(aborted.kind, TaskErrorKind::Aborted);
        let io = TaskError::from(&TxBatchError::ConnectionError("reset".into()));
        assert_eq!(io.kind, TaskErrorKind::Connection);
    }
}
