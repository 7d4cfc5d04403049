//! Criterion benchmark comparing the two commit policies over a file-backed `SQLite` pool.
//! Each iteration runs one batch: either every task succeeds (both policies commit) or the
//! middle task is rigged to fail, which is where fail-fast pays off against collect-all.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sql_txbatch::prelude::*;
use sql_txbatch::sqlite::schema;
use std::hint::black_box;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;

static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

struct BenchDb {
    pool: ConnectionPool<SqliteManager>,
    _dir: TempDir,
}

// Pool initialised once so iterations measure steady-state checkout, not file creation.
static BENCH_DB: LazyLock<BenchDb> = LazyLock::new(|| {
    let dir = tempfile::tempdir().expect("create bench tempdir");
    let opts = SqliteOptions::new(dir.path().join("bench.db"));
    let pool_options = PoolOptions::builder()
        .max_size(4)
        .finish()
        .expect("bench pool options");
    let pool = TOKIO_RUNTIME
        .block_on(async {
            let pool = ConnectionPool::new_sqlite(opts, pool_options).await?;
            schema::bootstrap(&pool).await?;
            Ok::<_, TxBatchError>(pool)
        })
        .expect("create bench pool");
    BenchDb { pool, _dir: dir }
});

fn task_count_to_run() -> usize {
    std::env::var("BENCH_TASKS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10)
}

fn bench_policy(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
    label: &str,
    policy: Policy,
    specs: &[TaskSpec],
) {
    let runtime = &*TOKIO_RUNTIME;
    let pool = BENCH_DB.pool.clone();

    group.bench_function(BenchmarkId::new(label, format!("{policy:?}")), |b| {
        let pool = pool.clone();
        let specs = specs.to_vec();
        b.to_async(runtime).iter_custom(move |iters| {
            let pool = pool.clone();
            let specs = specs.clone();
            async move {
                let mut total = Duration::default();
                for _ in 0..iters {
                    let start = Instant::now();
                    let result = run_batch(&pool, &specs, policy)
                        .await
                        .expect("run batch");
                    total += start.elapsed();
                    black_box(result);
                }
                schema::reset(&pool).await.expect("reset sample table");
                total
            }
        });
    });
}

fn batch_policies(c: &mut Criterion) {
    let task_count = task_count_to_run();
    let step = Duration::from_millis(1);
    let marker = i64::try_from(task_count / 2).unwrap_or(1).max(1);
    let clean = TaskSpec::sequence(task_count, step, None);
    let failing = TaskSpec::sequence(task_count, step, Some(marker));

    let mut group = c.benchmark_group("batch_policies");
    group.throughput(Throughput::Elements(task_count as u64));
    group.sample_size(20);

    for policy in [Policy::FailFast, Policy::CollectAll] {
        bench_policy(&mut group, "all_succeed", policy, &clean);
        bench_policy(&mut group, "middle_task_fails", policy, &failing);
    }

    group.finish();
}

criterion_group!(benches, batch_policies);
criterion_main!(benches);
