//! Transactional batch writes over a bounded async connection pool.
//!
//! A batch checks out one connection, opens a transaction, dispatches its write tasks
//! concurrently (their statements serialize on the shared connection), and commits only
//! if every outcome gathered at decision time succeeded. Either way the connection goes
//! back to the pool exactly once.
//!
//! ```rust,no_run
//! use sql_txbatch::prelude::*;
//!
//! # async fn demo() -> Result<(), TxBatchError> {
//! let pool = ConnectionPool::new_sqlite(
//!     SqliteOptions::new("batch.db"),
//!     PoolOptions::builder().max_size(4).finish()?,
//! )
//! .await?;
//! sql_txbatch::sqlite::schema::bootstrap(&pool).await?;
//!
//! let specs = TaskSpec::sequence(5, std::time::Duration::from_millis(10), Some(3));
//! let result = run_batch(&pool, &specs, Policy::FailFast).await?;
//! assert_eq!(result.decision, Decision::RolledBack);
//! # Ok(()) }
//! ```

pub mod batch;
pub mod config;
pub mod driver;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod session;
pub mod task;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use batch::{BatchError, BatchResult, Decision, Policy, run_batch};
pub use config::PoolOptions;
pub use error::TxBatchError;
pub use pool::{ConnectionPool, PoolState, PooledConnection};
pub use session::{SessionState, TransactionSession};
pub use task::{TaskOutcome, TaskSpec, WriteTask};
