//! Seam between the batch coordinator and a concrete database driver.
//!
//! The pool only needs to create connections and tell healthy ones from broken
//! ones ([`ManageConnection`]); the session only needs transaction control and
//! single-statement execution ([`Connection`]).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TxBatchError;

/// Positional parameter value bound into a [`Statement`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowValues {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl RowValues {
    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }
}

/// One write statement: SQL text, its positional parameters, and how long the store should
/// spend on it before writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<RowValues>,
    /// Time the statement keeps the connection busy ahead of the write itself, like a
    /// `pg_sleep` inside the insert. Counts against the statement timeout.
    pub delay: Duration,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<RowValues>) -> Self {
        Self {
            sql: sql.into(),
            params,
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A physical connection as seen by a transaction session.
///
/// Implementations serialize their own statements; callers may hold a shared
/// reference from several futures at once.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a transaction on this connection.
    async fn begin(&self) -> Result<(), TxBatchError>;

    /// Commit the open transaction.
    async fn commit(&self) -> Result<(), TxBatchError>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> Result<(), TxBatchError>;

    /// Execute one statement and return the number of affected rows. The connection stays
    /// occupied for `statement.delay` before the write.
    async fn execute(&self, statement: &Statement) -> Result<u64, TxBatchError>;

    /// True once the connection hit an unrecoverable I/O error.
    fn is_broken(&self) -> bool;
}

/// Factory the pool uses to create and vet connections.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Connection + 'static;

    /// Open a new physical connection.
    async fn connect(&self) -> Result<Self::Connection, TxBatchError>;

    /// Cheap check run on release; a broken connection is discarded instead of idled.
    fn has_broken(&self, conn: &Self::Connection) -> bool {
        conn.is_broken()
    }
}
