#![allow(dead_code)]

use std::time::Duration;

use sql_txbatch::prelude::*;
use sql_txbatch::sqlite::schema;
use tempfile::TempDir;

/// File-backed `SQLite` pool in a temp dir that is removed on drop.
pub struct TestDb {
    pub pool: ConnectionPool<SqliteManager>,
    _dir: TempDir,
}

impl TestDb {
    pub fn manager(&self) -> &SqliteManager {
        self.pool.manager()
    }

    pub async fn rows(&self) -> Result<i64, TxBatchError> {
        schema::count_rows(&self.pool).await
    }

    pub async fn sequences(&self) -> Result<Vec<i64>, TxBatchError> {
        schema::persisted_sequences(&self.pool).await
    }
}

pub async fn sqlite_db(pool_options: PoolOptions) -> Result<TestDb, TxBatchError> {
    sqlite_db_with(pool_options, |opts| opts).await
}

/// Same as [`sqlite_db`], with a chance to adjust the driver options first.
pub async fn sqlite_db_with(
    pool_options: PoolOptions,
    configure: impl FnOnce(SqliteOptions) -> SqliteOptions,
) -> Result<TestDb, TxBatchError> {
    let dir = tempfile::tempdir()
        .map_err(|e| TxBatchError::Other(format!("tempdir: {e}")))?;
    let opts = configure(SqliteOptions::new(dir.path().join("batch.db")));
    let pool = ConnectionPool::new_sqlite(opts, pool_options).await?;
    schema::bootstrap(&pool).await?;
    Ok(TestDb { pool, _dir: dir })
}

pub async fn default_db() -> Result<TestDb, TxBatchError> {
    sqlite_db(
        PoolOptions::builder()
            .max_size(4)
            .connect_timeout(Duration::from_secs(5))
            .finish()?,
    )
    .await
}

/// Five tasks, task N waiting N * 10ms, optionally rigged to fail at `fail_at`.
pub fn five_tasks(fail_at: Option<i64>) -> Vec<TaskSpec> {
    TaskSpec::sequence(5, Duration::from_millis(10), fail_at)
}
