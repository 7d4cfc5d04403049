mod args;
mod logging;

use clap::Parser;
use serde::Serialize;

use sql_txbatch::prelude::*;
use sql_txbatch::sqlite::schema;

use crate::args::{Args, RunConfig};

#[derive(Serialize)]
struct Report<'a> {
    result: &'a BatchResult,
    persisted_rows: i64,
    pool: PoolState,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match RunConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = logging::init(config.log_level, config.log.as_deref()) {
        eprintln!("failed to open log file: {err}");
        std::process::exit(1);
    }

    let config_json = serde_json::to_string(&config).unwrap_or_else(|_| "{}".to_string());
    tracing::info!("config: {}", config_json);

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "batch run failed");
        std::process::exit(1);
    }
}

async fn run(config: RunConfig) -> Result<(), TxBatchError> {
    let pool = ConnectionPool::new_sqlite(SqliteOptions::new(&config.db), config.pool).await?;
    schema::bootstrap(&pool).await?;
    if config.reset {
        schema::reset(&pool).await?;
    }

    let result = run_batch(&pool, &config.specs, config.policy).await?;
    let report = Report {
        result: &result,
        persisted_rows: schema::count_rows(&pool).await?,
        pool: pool.state(),
    };
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|e| TxBatchError::Other(format!("failed to render report: {e}")))?;
    println!("{rendered}");

    pool.shutdown();
    Ok(())
}
