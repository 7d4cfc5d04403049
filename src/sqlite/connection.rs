use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::InterruptHandle;

use crate::driver::{Connection, Statement};
use crate::error::TxBatchError;

use super::config::FaultPlan;
use super::params::Params;

pub(crate) type SharedSqliteConnection = Arc<tokio::sync::Mutex<rusqlite::Connection>>;

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

/// One physical `SQLite` connection. Blocking calls run on tokio's blocking pool behind an
/// async mutex, so statements submitted from several futures execute one at a time.
pub struct SqliteConnection {
    conn: SharedSqliteConnection,
    interrupt: InterruptHandle,
    statement_timeout: Duration,
    in_transaction: AtomicBool,
    broken: AtomicBool,
    faults: Arc<FaultPlan>,
}

impl SqliteConnection {
    pub(crate) fn new(
        raw: rusqlite::Connection,
        statement_timeout: Duration,
        faults: Arc<FaultPlan>,
    ) -> Self {
        let interrupt = raw.get_interrupt_handle();
        Self {
            conn: Arc::new(tokio::sync::Mutex::new(raw)),
            interrupt,
            statement_timeout,
            in_transaction: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            faults,
        }
    }

    /// Run synchronous work against the raw connection outside of any transaction.
    ///
    /// # Errors
    /// Returns `TxBatchError::TransactionState` while a transaction is open, or whatever `func`
    /// returns.
    pub async fn with_connection<F, R>(&self, func: F) -> Result<R, TxBatchError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, TxBatchError> + Send + 'static,
        R: Send + 'static,
    {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(TxBatchError::TransactionState(
                "SQLite transaction in progress; operation not permitted (with connection)".into(),
            ));
        }
        self.ensure_not_broken()?;
        run_blocking(self.conn_handle(), func).await
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    pub(crate) fn conn_handle(&self) -> SharedSqliteConnection {
        Arc::clone(&self.conn)
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Mark the connection broken when `result` says it can no longer be trusted.
    fn absorb<R>(&self, result: Result<R, TxBatchError>) -> Result<R, TxBatchError> {
        if let Err(err) = &result {
            if err.is_connection_error() {
                self.mark_broken();
            }
        }
        result
    }

    fn ensure_not_broken(&self) -> Result<(), TxBatchError> {
        if self.is_broken() {
            Err(TxBatchError::ConnectionError(
                "SQLite connection is broken".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn begin(&self) -> Result<(), TxBatchError> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(TxBatchError::TransactionState(
                "SQLite transaction already in progress".into(),
            ));
        }
        self.ensure_not_broken()?;
        // IMMEDIATE takes the write lock up front so concurrent sessions queue on
        // busy_timeout instead of deadlocking on a lock upgrade.
        let result = run_blocking(self.conn_handle(), |guard| {
            guard.execute_batch("BEGIN IMMEDIATE").map_err(begin_error)
        })
        .await;
        self.absorb(result)?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), TxBatchError> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(TxBatchError::TransactionState(
                "SQLite transaction not active".into(),
            ));
        }
        if self.is_broken() {
            return Err(TxBatchError::CommitError(
                "SQLite connection is broken".into(),
            ));
        }
        if self.faults.fail_commit() {
            return Err(TxBatchError::CommitError("simulated commit failure".into()));
        }
        let result = run_blocking(self.conn_handle(), |guard| {
            guard.execute_batch("COMMIT").map_err(|e| {
                if is_fatal(&e) {
                    TxBatchError::ConnectionError(format!("COMMIT failed: {e}"))
                } else {
                    TxBatchError::CommitError(e.to_string())
                }
            })
        })
        .await;
        self.absorb(result)?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TxBatchError> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(TxBatchError::TransactionState(
                "SQLite transaction not active".into(),
            ));
        }
        // Whatever happens below, the transaction is over from this connection's view:
        // either ROLLBACK ran or the connection gets discarded, which aborts it.
        self.in_transaction.store(false, Ordering::SeqCst);
        if self.is_broken() {
            return Err(TxBatchError::RollbackError(
                "SQLite connection is broken".into(),
            ));
        }
        if self.faults.fail_rollback() {
            self.mark_broken();
            return Err(TxBatchError::RollbackError(
                "simulated rollback failure".into(),
            ));
        }
        let result = run_blocking(self.conn_handle(), rollback_with_busy_retries).await;
        if let Err(err) = result {
            self.mark_broken();
            return Err(TxBatchError::RollbackError(err.to_string()));
        }
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, TxBatchError> {
        self.ensure_not_broken()?;
        if self.faults.take_io_failure() {
            self.mark_broken();
            return Err(TxBatchError::ConnectionError(
                "simulated I/O failure while executing statement".into(),
            ));
        }

        let sql = statement.sql.clone();
        let params = Params::convert(&statement.params);
        let delay = statement.delay;
        let stall = self.faults.statement_delay();
        let expects_tx = self.in_transaction();
        let conn = self.conn_handle();
        let work = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            run_blocking(conn, move |guard| {
                if let Some(stall) = stall {
                    thread::sleep(stall);
                }
                // A statement that outlived its timeout may get the lock only after the
                // transaction ended; running it now would autocommit it.
                if expects_tx && guard.is_autocommit() {
                    return Err(TxBatchError::TransactionState(
                        "transaction ended before statement ran".into(),
                    ));
                }
                let rows = guard
                    .execute(&sql, rusqlite::params_from_iter(params.as_values()))
                    .map_err(statement_error)?;
                Ok(rows as u64)
            })
            .await
        };

        let result = match tokio::time::timeout(self.statement_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                self.interrupt.interrupt();
                Err(TxBatchError::StatementTimeout(self.statement_timeout))
            }
        };
        self.absorb(result)
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("in_transaction", &self.in_transaction())
            .field("broken", &self.is_broken())
            .field("statement_timeout", &self.statement_timeout)
            .finish_non_exhaustive()
    }
}

/// Result codes after which the connection, or the file behind it, cannot be trusted again.
fn is_fatal(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::DatabaseCorrupt
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::CannotOpen
            )
    )
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn statement_error(err: rusqlite::Error) -> TxBatchError {
    if is_fatal(&err) {
        TxBatchError::ConnectionError(format!("statement failed: {err}"))
    } else {
        TxBatchError::StatementFailure(err.to_string())
    }
}

/// `SQLITE_BUSY` on BEGIN only means another writer held the lock past `busy_timeout`; the
/// connection itself is fine.
fn begin_error(err: rusqlite::Error) -> TxBatchError {
    if is_busy(&err) {
        TxBatchError::Busy(format!("BEGIN failed: {err}"))
    } else {
        TxBatchError::ConnectionError(format!("BEGIN failed: {err}"))
    }
}

pub(crate) async fn run_blocking<F, R>(
    conn: SharedSqliteConnection,
    func: F,
) -> Result<R, TxBatchError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, TxBatchError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        func(&mut guard)
    })
    .await?
}

fn rollback_with_busy_retries(guard: &mut rusqlite::Connection) -> Result<(), TxBatchError> {
    for (idx, delay) in ROLLBACK_BUSY_RETRIES.iter().copied().enumerate() {
        match guard.execute_batch("ROLLBACK") {
            Ok(()) => return Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    && idx + 1 < ROLLBACK_BUSY_RETRIES.len() =>
            {
                thread::sleep(delay);
            }
            Err(err) => return Err(TxBatchError::SqliteError(err)),
        }
    }

    Err(TxBatchError::RollbackError("rollback retries exhausted".into()))
}

#[cfg(test)]
mod tests {
    use rusqlite::ffi;

    use super::*;

    fn failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    fn in_memory() -> SqliteConnection {
        let raw = rusqlite::Connection::open_in_memory().unwrap();
        SqliteConnection::new(raw, Duration::from_secs(1), Arc::new(FaultPlan::default()))
    }

    #[test]
    fn io_and_corruption_codes_are_connection_errors() {
        for code in [
            ffi::SQLITE_IOERR,
            ffi::SQLITE_CORRUPT,
            ffi::SQLITE_NOTADB,
            ffi::SQLITE_CANTOPEN,
        ] {
            assert!(
                statement_error(failure(code)).is_connection_error(),
                "code {code}"
            );
        }
    }

    #[test]
    fn ordinary_statement_errors_keep_the_connection() {
        let err = statement_error(failure(ffi::SQLITE_CONSTRAINT));
        assert!(matches!(err, TxBatchError::StatementFailure(_)));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn busy_begin_is_not_a_connection_error() {
        assert!(matches!(
            begin_error(failure(ffi::SQLITE_BUSY)),
            TxBatchError::Busy(_)
        ));
        assert!(begin_error(failure(ffi::SQLITE_IOERR)).is_connection_error());
    }

    #[test]
    fn fatal_driver_error_marks_connection_broken() {
        let conn = in_memory();
        let kept: Result<(), _> = conn.absorb(Err(statement_error(failure(ffi::SQLITE_CONSTRAINT))));
        assert!(kept.is_err());
        assert!(!conn.is_broken());

        let lost: Result<(), _> = conn.absorb(Err(statement_error(failure(ffi::SQLITE_IOERR))));
        assert!(lost.is_err());
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn statement_delay_holds_the_connection() {
        let conn = in_memory();
        conn.with_connection(|raw| {
            raw.execute_batch("CREATE TABLE t (v INTEGER)")?;
            Ok(())
        })
        .await
        .unwrap();

        let stmt = Statement::new("INSERT INTO t VALUES (1)", Vec::new())
            .with_delay(Duration::from_millis(40));
        let started = std::time::Instant::now();
        assert_eq!(conn.execute(&stmt).await.unwrap(), 1);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
