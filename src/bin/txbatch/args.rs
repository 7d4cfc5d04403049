use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

use sql_txbatch::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one transactional write batch against SQLite")]
pub(crate) struct Args {
    /// SQLite database file; created if missing.
    #[arg(long, default_value = "txbatch.db")]
    pub(crate) db: PathBuf,
    /// Number of write tasks, numbered from 1.
    #[arg(long, default_value_t = 5)]
    pub(crate) tasks: usize,
    /// Sequence number of the task that fails after issuing its insert.
    #[arg(long)]
    pub(crate) fail_at: Option<i64>,
    #[arg(long, value_enum, default_value = "fail-fast")]
    pub(crate) policy: Policy,
    /// Latency step; task N holds the connection N times this long before its insert. Counts
    /// against the pool's statement timeout.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0ms")]
    pub(crate) latency: Duration,
    /// JSON file with pool options (min_size, max_size, connect_timeout, statement_timeout).
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// Override the pool's max_size.
    #[arg(long)]
    pub(crate) max_size: Option<usize>,
    /// Delete existing sample rows before running.
    #[arg(long)]
    pub(crate) reset: bool,
    /// Also write logs to this file.
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    /// Most verbose level to log: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    pub(crate) log_level: Level,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunConfig {
    pub(crate) db: PathBuf,
    pub(crate) policy: Policy,
    pub(crate) pool: PoolOptions,
    pub(crate) specs: Vec<TaskSpec>,
    pub(crate) reset: bool,
    pub(crate) log: Option<PathBuf>,
    #[serde(skip)]
    pub(crate) log_level: Level,
}

impl RunConfig {
    pub(crate) fn from_args(args: Args) -> Result<Self, TxBatchError> {
        let mut pool = match &args.config {
            Some(path) => PoolOptions::from_file(path)?,
            None => PoolOptions::default(),
        };
        if let Some(max_size) = args.max_size {
            pool.max_size = max_size;
            pool.min_size = pool.min_size.min(max_size);
        }
        pool.validate()?;

        Ok(RunConfig {
            db: args.db,
            policy: args.policy,
            pool,
            specs: TaskSpec::sequence(args.tasks, args.latency, args.fail_at),
            reset: args.reset,
            log: args.log,
            log_level: args.log_level,
        })
    }
}
