use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::driver::{Connection, ManageConnection, Statement};
use crate::error::TxBatchError;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::task::StatementTarget;

/// Lifecycle of a session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::RolledBack)
    }
}

struct SessionInner {
    state: SessionState,
    rollback_error: Option<String>,
}

/// One transaction bound to one checked-out connection.
///
/// Statements, commit and rollback all take the same async gate, so work submitted
/// from concurrent futures reaches the connection one statement at a time and never
/// after the transaction has ended. `close()` hands the connection back to the pool;
/// dropping an unclosed session with an open transaction discards the connection.
pub struct TransactionSession<M: ManageConnection> {
    conn: Option<PooledConnection<M>>,
    connection_id: u64,
    gate: tokio::sync::Mutex<()>,
    inner: Mutex<SessionInner>,
    discard: AtomicBool,
}

impl<M: ManageConnection> TransactionSession<M> {
    /// Check out a connection using the pool's `connect_timeout`.
    ///
    /// # Errors
    /// Returns `TxBatchError::PoolTimeout` or `TxBatchError::PoolClosed` from the pool.
    pub async fn open(pool: &ConnectionPool<M>) -> Result<Self, TxBatchError> {
        let conn = pool.acquire().await?;
        Ok(Self::from_connection(conn))
    }

    /// Check out a connection waiting at most `timeout`.
    ///
    /// # Errors
    /// Returns `TxBatchError::PoolTimeout` or `TxBatchError::PoolClosed` from the pool.
    pub async fn open_timeout(
        pool: &ConnectionPool<M>,
        timeout: Duration,
    ) -> Result<Self, TxBatchError> {
        let conn = pool.acquire_timeout(timeout).await?;
        Ok(Self::from_connection(conn))
    }

    #[must_use]
    pub fn from_connection(conn: PooledConnection<M>) -> Self {
        Self {
            connection_id: conn.id(),
            conn: Some(conn),
            gate: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                rollback_error: None,
            }),
            discard: AtomicBool::new(false),
        }
    }

    /// Pool identifier of the connection this session owns.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    /// Secondary error swallowed by the last rollback, if any.
    #[must_use]
    pub fn rollback_error(&self) -> Option<String> {
        self.lock_inner().rollback_error.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Open the transaction: `Idle -> Active`.
    ///
    /// # Errors
    /// Returns `TxBatchError::TransactionState` if the session is not idle or already closed, or
    /// the driver's `ConnectionError` if `BEGIN` fails.
    pub async fn begin(&self) -> Result<(), TxBatchError> {
        let _gate = self.gate.lock().await;
        let state = self.state();
        if state != SessionState::Idle {
            return Err(TxBatchError::TransactionState(format!(
                "cannot begin a session in state {state:?}"
            )));
        }
        let conn = self.conn()?;
        if let Err(err) = conn.begin().await {
            self.note_failure(&err);
            return Err(err);
        }
        self.set_state(SessionState::Active);
        tracing::debug!(conn_id = self.connection_id, "transaction begun");
        Ok(())
    }

    /// Execute one statement inside the open transaction.
    ///
    /// # Errors
    /// Returns `TxBatchError::TransactionState` once the transaction is no longer active, or the
    /// driver's error for the statement.
    pub async fn execute(&self, statement: &Statement) -> Result<u64, TxBatchError> {
        let _gate = self.gate.lock().await;
        let state = self.state();
        if state != SessionState::Active {
            return Err(TxBatchError::TransactionState(format!(
                "transaction is {state:?}; statement refused"
            )));
        }
        let conn = self.conn()?;
        conn.execute(statement).await.inspect_err(|err| {
            self.note_failure(err);
        })
    }

    /// Commit: `Active -> Committed`. On failure the session stays `Active` so the caller can
    /// still roll back.
    ///
    /// # Errors
    /// Returns `TxBatchError::CommitError` if the store rejects the commit, or
    /// `TxBatchError::TransactionState` if no transaction is active.
    pub async fn commit(&self) -> Result<(), TxBatchError> {
        let _gate = self.gate.lock().await;
        let state = self.state();
        if state != SessionState::Active {
            return Err(TxBatchError::TransactionState(format!(
                "cannot commit a session in state {state:?}"
            )));
        }
        let conn = self.conn()?;
        match conn.commit().await {
            Ok(()) => {
                self.set_state(SessionState::Committed);
                tracing::debug!(conn_id = self.connection_id, "transaction committed");
                Ok(())
            }
            Err(err) => {
                self.note_failure(&err);
                Err(match err {
                    TxBatchError::CommitError(_) => err,
                    other => TxBatchError::CommitError(other.to_string()),
                })
            }
        }
    }

    /// Roll back: `Active -> RolledBack`. Best effort; a failing `ROLLBACK` is logged,
    /// remembered for [`rollback_error`](Self::rollback_error), and the connection is discarded
    /// at close. Calling it outside an active transaction does nothing.
    pub async fn rollback(&self) {
        let _gate = self.gate.lock().await;
        let state = self.state();
        if state != SessionState::Active {
            tracing::debug!(
                conn_id = self.connection_id,
                ?state,
                "rollback skipped; transaction not active"
            );
            return;
        }
        let result = match self.conn() {
            Ok(conn) => conn.rollback().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::warn!(
                conn_id = self.connection_id,
                error = %err,
                "rollback failed; connection will be discarded"
            );
            self.discard.store(true, Ordering::SeqCst);
            self.lock_inner().rollback_error = Some(err.to_string());
        }
        self.set_state(SessionState::RolledBack);
        tracing::debug!(conn_id = self.connection_id, "transaction rolled back");
    }

    /// Release the connection to the pool, rolling back first if the transaction is still
    /// open. Idempotent; returns the final state.
    pub async fn close(&mut self) -> SessionState {
        if self.conn.is_none() {
            return self.state();
        }
        if self.state() == SessionState::Active {
            self.rollback().await;
        }
        if let Some(mut conn) = self.conn.take() {
            if self.discard.load(Ordering::SeqCst) || conn.is_broken() {
                conn.mark_broken();
            }
            tracing::debug!(
                conn_id = self.connection_id,
                discard = conn.is_marked_broken(),
                "session closed"
            );
            drop(conn);
        }
        self.state()
    }

    fn conn(&self) -> Result<&PooledConnection<M>, TxBatchError> {
        self.conn.as_ref().ok_or_else(|| {
            TxBatchError::TransactionState("session already closed".into())
        })
    }

    fn note_failure(&self, err: &TxBatchError) {
        if err.is_connection_error() {
            self.discard.store(true, Ordering::SeqCst);
        }
    }

    fn set_state(&self, state: SessionState) {
        self.lock_inner().state = state;
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl<M: ManageConnection> StatementTarget for TransactionSession<M> {
    async fn execute(&self, statement: &Statement) -> Result<u64, TxBatchError> {
        TransactionSession::execute(self, statement).await
    }
}

impl<M: ManageConnection> Drop for TransactionSession<M> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let state = self.state();
            if state == SessionState::Active || self.discard.load(Ordering::SeqCst) {
                tracing::warn!(
                    conn_id = self.connection_id,
                    ?state,
                    "session dropped without close; discarding connection"
                );
                conn.mark_broken();
            }
        }
    }
}
