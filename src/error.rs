use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the pool, the session, and the driver layer.
#[derive(Debug, Error)]
pub enum TxBatchError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Pool timeout: no connection available within {waited:?}")]
    PoolTimeout { waited: Duration },

    #[error("Pool closed")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Statement failure: {0}")]
    StatementFailure(String),

    #[error("Statement timed out after {0:?}")]
    StatementTimeout(Duration),

    #[error("Commit error: {0}")]
    CommitError(String),

    #[error("Rollback error: {0}")]
    RollbackError(String),

    #[error("Transaction state error: {0}")]
    TransactionState(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl TxBatchError {
    /// True when the error means the physical connection can no longer be trusted.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TxBatchError::ConnectionError(_))
    }
}

impl From<serde_json::Error> for TxBatchError {
    fn from(err: serde_json::Error) -> Self {
        TxBatchError::ConfigError(format!("invalid pool options: {err}"))
    }
}

impl From<tokio::task::JoinError> for TxBatchError {
    fn from(err: tokio::task::JoinError) -> Self {
        TxBatchError::ConnectionError(format!("blocking task join error: {err}"))
    }
}
