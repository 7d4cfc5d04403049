//! Convenient imports for common functionality.

pub use crate::batch::{
    BatchError, BatchExecutor, BatchResult, Decision, OutcomeAggregator, Policy, run_batch,
};
pub use crate::config::{PoolOptions, PoolOptionsBuilder};
pub use crate::driver::{Connection, ManageConnection, RowValues, Statement};
pub use crate::error::TxBatchError;
pub use crate::pool::{ConnectionPool, PoolState, PooledConnection};
pub use crate::session::{SessionState, TransactionSession};
pub use crate::task::{
    StatementTarget, TaskError, TaskErrorKind, TaskOutcome, TaskSpec, WriteTask,
};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteConnection, SqliteManager, SqliteOptions};
