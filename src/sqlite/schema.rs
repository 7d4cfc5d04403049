//! Sample table the write tasks insert into, plus inspection helpers used by the CLI and tests.

use crate::error::TxBatchError;
use crate::pool::ConnectionPool;

use super::config::SqliteManager;

pub const SAMPLE_TABLE: &str = "batch_sample";

const SAMPLE_TABLE_DDL: &str = "
CREATE TABLE IF NOT EXISTS batch_sample (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    amount INTEGER NOT NULL,
    sequence_number INTEGER NOT NULL,
    latency_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);";

/// Create the sample table if it does not exist.
///
/// # Errors
/// Returns `TxBatchError` if no connection is available or the DDL fails.
pub async fn bootstrap(pool: &ConnectionPool<SqliteManager>) -> Result<(), TxBatchError> {
    let conn = pool.acquire().await?;
    conn.with_connection(|raw| raw.execute_batch(SAMPLE_TABLE_DDL).map_err(Into::into))
        .await
}

/// Delete every row from the sample table.
///
/// # Errors
/// Returns `TxBatchError` if no connection is available or the delete fails.
pub async fn reset(pool: &ConnectionPool<SqliteManager>) -> Result<(), TxBatchError> {
    let conn = pool.acquire().await?;
    conn.with_connection(|raw| {
        raw.execute("DELETE FROM batch_sample", [])?;
        Ok(())
    })
    .await
}

/// Number of committed rows in the sample table.
///
/// # Errors
/// Returns `TxBatchError` if no connection is available or the query fails.
pub async fn count_rows(pool: &ConnectionPool<SqliteManager>) -> Result<i64, TxBatchError> {
    let conn = pool.acquire().await?;
    conn.with_connection(|raw| {
        raw.query_row("SELECT COUNT(*) FROM batch_sample", [], |row| row.get(0))
            .map_err(Into::into)
    })
    .await
}

/// Sequence numbers of committed rows, ascending.
///
/// # Errors
/// Returns `TxBatchError` if no connection is available or the query fails.
pub async fn persisted_sequences(
    pool: &ConnectionPool<SqliteManager>,
) -> Result<Vec<i64>, TxBatchError> {
    let conn = pool.acquire().await?;
    conn.with_connection(|raw| {
        let mut stmt =
            raw.prepare("SELECT sequence_number FROM batch_sample ORDER BY sequence_number")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>().map_err(Into::into)
    })
    .await
}
