#![cfg(feature = "sqlite")]

mod common;

use std::time::{Duration, Instant};

use sql_txbatch::prelude::*;

use common::{five_tasks, sqlite_db};

fn single_connection(connect_timeout: Duration) -> Result<PoolOptions, TxBatchError> {
    PoolOptions::builder()
        .max_size(1)
        .connect_timeout(connect_timeout)
        .finish()
}

/// With one connection, a second batch waits for the first one's `close()` and then runs
/// on the very same connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_batch_waits_for_first_to_release() -> Result<(), TxBatchError> {
    let db = sqlite_db(single_connection(Duration::from_secs(5))?).await?;
    let slow = TaskSpec::sequence(3, Duration::from_millis(60), None);

    let first = {
        let pool = db.pool.clone();
        let specs = slow.clone();
        tokio::spawn(async move {
            let result = run_batch(&pool, &specs, Policy::CollectAll).await;
            (result, Instant::now())
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    // The first batch holds the only connection.
    let state = db.pool.state();
    assert_eq!(state.active, 1);
    assert_eq!(state.idle, 0);
    assert!(matches!(
        db.pool.acquire_timeout(Duration::from_millis(10)).await,
        Err(TxBatchError::PoolTimeout { .. })
    ));

    let second = {
        let pool = db.pool.clone();
        tokio::spawn(async move {
            let result = run_batch(&pool, &five_tasks(None), Policy::FailFast).await;
            (result, Instant::now())
        })
    };

    let (first_result, first_done) = first
        .await
        .map_err(|e| TxBatchError::Other(e.to_string()))?;
    let (second_result, second_done) = second
        .await
        .map_err(|e| TxBatchError::Other(e.to_string()))?;
    let first_result = first_result?;
    let second_result = second_result?;

    assert!(first_result.is_committed());
    assert!(second_result.is_committed());
    assert!(second_done >= first_done);
    assert_eq!(first_result.connection_id, second_result.connection_id);

    let state = db.pool.state();
    assert_eq!(state.created, 1);
    assert_eq!(state.active, 0);
    assert_eq!(db.rows().await?, 8);
    Ok(())
}

#[tokio::test]
async fn checkout_fails_with_pool_timeout_when_exhausted() -> Result<(), TxBatchError> {
    let db = sqlite_db(single_connection(Duration::from_millis(50))?).await?;
    let held = db.pool.acquire().await?;

    let started = Instant::now();
    let err = run_batch(&db.pool, &five_tasks(None), Policy::CollectAll)
        .await
        .expect_err("pool is exhausted");

    assert!(matches!(err, TxBatchError::PoolTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(50));
    // No session existed, so nothing was released on its behalf.
    assert_eq!(db.pool.state().active, 1);

    drop(held);
    assert_eq!(db.rows().await?, 0);
    Ok(())
}

#[tokio::test]
async fn connection_released_exactly_once_per_batch() -> Result<(), TxBatchError> {
    let db = sqlite_db(single_connection(Duration::from_secs(2))?).await?;
    let before = db.pool.state().released;

    run_batch(&db.pool, &five_tasks(None), Policy::CollectAll).await?;
    let after_commit = db.pool.state();
    assert_eq!(after_commit.released, before + 1);
    assert_eq!(after_commit.idle, 1);
    assert_eq!(after_commit.active, 0);

    run_batch(&db.pool, &five_tasks(Some(4)), Policy::FailFast).await?;
    let after_failure = db.pool.state();
    assert_eq!(after_failure.released, before + 2);
    assert_eq!(after_failure.idle, 1);
    assert_eq!(after_failure.discarded, 0);

    run_batch(&db.pool, &five_tasks(Some(1)), Policy::CollectAll).await?;
    assert_eq!(db.pool.state().released, before + 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_never_exceed_max_size() -> Result<(), TxBatchError> {
    let db = sqlite_db(
        PoolOptions::builder()
            .max_size(2)
            .connect_timeout(Duration::from_secs(10))
            .finish()?,
    )
    .await?;

    let mut handles = Vec::new();
    for batch in 0..6_i64 {
        let pool = db.pool.clone();
        let fail_at = if batch % 2 == 0 { None } else { Some(2) };
        handles.push(tokio::spawn(async move {
            let specs = TaskSpec::sequence(3, Duration::from_millis(5), fail_at);
            let result = run_batch(&pool, &specs, Policy::CollectAll).await;
            let state = pool.state();
            assert!(state.active + state.idle <= state.max_size);
            result
        }));
    }

    let mut committed = 0;
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| TxBatchError::Other(e.to_string()))??;
        if result.is_committed() {
            committed += 1;
        }
    }

    assert_eq!(committed, 3);
    let state = db.pool.state();
    assert!(state.created <= 2);
    assert_eq!(state.active, 0);
    assert_eq!(db.rows().await?, 9);
    Ok(())
}

#[tokio::test]
async fn shutdown_pool_rejects_new_batches() -> Result<(), TxBatchError> {
    let db = sqlite_db(single_connection(Duration::from_secs(1))?).await?;
    db.pool.shutdown();

    let err = run_batch(&db.pool, &five_tasks(None), Policy::FailFast)
        .await
        .expect_err("pool is closed");
    assert!(matches!(err, TxBatchError::PoolClosed));
    Ok(())
}
