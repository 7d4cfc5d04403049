use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolOptions;
use crate::driver::ManageConnection;
use crate::error::TxBatchError;
use crate::pool::ConnectionPool;

use super::connection::SqliteConnection;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for opening `SQLite` connections.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub db_path: PathBuf,
    pub busy_timeout: Duration,
    pub statement_timeout: Duration,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn with_statement_timeout(mut self, statement_timeout: Duration) -> Self {
        self.statement_timeout = statement_timeout;
        self
    }
}

/// Simulated driver faults, shared by every connection a manager opens.
#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
    io_failure_after: Mutex<Option<usize>>,
    statement_delay_ms: AtomicU64,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl FaultPlan {
    /// Count one statement against the I/O failure budget; true when this one must fail.
    pub(crate) fn take_io_failure(&self) -> bool {
        let mut remaining = self
            .io_failure_after
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match *remaining {
            Some(0) => {
                *remaining = None;
                true
            }
            Some(n) => {
                *remaining = Some(n - 1);
                false
            }
            None => false,
        }
    }

    pub(crate) fn statement_delay(&self) -> Option<Duration> {
        match self.statement_delay_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(crate) fn fail_commit(&self) -> bool {
        self.fail_commit.load(Ordering::Relaxed)
    }

    pub(crate) fn fail_rollback(&self) -> bool {
        self.fail_rollback.load(Ordering::Relaxed)
    }
}

/// Connection manager that opens file-backed `SQLite` connections in WAL mode.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    opts: SqliteOptions,
    faults: Arc<FaultPlan>,
}

impl SqliteManager {
    #[must_use]
    pub fn new(opts: SqliteOptions) -> Self {
        Self {
            opts,
            faults: Arc::new(FaultPlan::default()),
        }
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.opts
    }

    /// Test-only hook: let `statements` more statements succeed, then fail the next one with a
    /// connection error that leaves its connection broken. `None` disarms the hook.
    #[doc(hidden)]
    pub fn set_io_failure_after_for_tests(&self, statements: Option<usize>) {
        *self
            .faults
            .io_failure_after
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = statements;
    }

    /// Test-only hook: stall every statement on its blocking thread for `delay`.
    #[doc(hidden)]
    pub fn set_statement_delay_for_tests(&self, delay: Option<Duration>) {
        let ms = delay.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.faults.statement_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Test-only hook: make `COMMIT` fail without touching the store.
    #[doc(hidden)]
    pub fn set_fail_commit_for_tests(&self, fail: bool) {
        self.faults.fail_commit.store(fail, Ordering::Relaxed);
    }

    /// Test-only hook: make `ROLLBACK` fail without touching the store.
    #[doc(hidden)]
    pub fn set_fail_rollback_for_tests(&self, fail: bool) {
        self.faults.fail_rollback.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl ManageConnection for SqliteManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection, TxBatchError> {
        let path = self.opts.db_path.clone();
        let busy_timeout = self.opts.busy_timeout;
        let raw = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            Ok::<_, TxBatchError>(conn)
        })
        .await?
        .map_err(|e| {
            TxBatchError::ConnectionError(format!("failed to open SQLite connection: {e}"))
        })?;

        Ok(SqliteConnection::new(
            raw,
            self.opts.statement_timeout,
            Arc::clone(&self.faults),
        ))
    }
}

impl ConnectionPool<SqliteManager> {
    /// Build a pool of `SQLite` connections.
    ///
    /// The pool's `statement_timeout` overrides the one in `opts`.
    ///
    /// # Errors
    /// Returns `TxBatchError` if the options are invalid or a warm-up connection fails to open.
    pub async fn new_sqlite(
        opts: SqliteOptions,
        pool_options: PoolOptions,
    ) -> Result<Self, TxBatchError> {
        let opts = opts.with_statement_timeout(pool_options.statement_timeout);
        ConnectionPool::build(SqliteManager::new(opts), pool_options).await
    }
}
