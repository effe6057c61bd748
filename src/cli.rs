//! Command-line interface definitions using clap.

use crate::coordinator::DEFAULT_BATCH_SIZE;
use crate::logging::{LogFormat, LogRotation};
use crate::worker::pool::default_worker_count;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Run parallel writer processes against one shared store and verify the result.
#[derive(Parser, Debug)]
#[command(name = "hmull")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run directory holding the store, lock file and logs.
    #[arg(long, env = "HMULL_ROOT", default_value = ".local", global = true)]
    pub root: PathBuf,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Start a new log file every hour or day.
    #[arg(long, value_enum, global = true)]
    pub log_rotation: Option<LogRotationArg>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one batch of jobs and verify the store count.
    Run(RunArgs),

    /// Run increasing job sizes back to back on one pool.
    Sweep(SweepArgs),

    /// Internal: serve jobs as a worker process.
    #[command(hide = true)]
    Worker,
}

/// Options shared by every command that starts a pool.
#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Number of worker processes.
    #[arg(short, long, default_value_t = default_worker_count())]
    pub workers: usize,

    /// Jobs submitted to the pool before their results are collected.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Show a progress bar.
    #[arg(long)]
    pub progress: bool,

    /// Keep existing records instead of resetting the store.
    #[arg(long)]
    pub keep_store: bool,

    /// Simulated work per job in milliseconds, before the lock is taken.
    #[arg(long, default_value_t = 0)]
    pub work_delay_ms: u64,

    /// Record every guarded write interval to this file.
    #[arg(long)]
    pub lock_trace: Option<PathBuf>,
}

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of jobs.
    #[arg(short, long)]
    pub jobs: u64,

    /// Records written by each job.
    #[arg(short, long)]
    pub ops: u64,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Arguments for the sweep command.
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// First size (jobs = ops = size).
    #[arg(long, default_value_t = 100)]
    pub start: u64,

    /// Sizes stop below this value.
    #[arg(long, default_value_t = 1000)]
    pub stop: u64,

    /// Size increment.
    #[arg(long, default_value_t = 100)]
    pub step: u64,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Log format argument (mirrors [`LogFormat`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Log rotation argument (mirrors [`LogRotation`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogRotationArg {
    Hourly,
    Daily,
    Never,
}

impl From<LogRotationArg> for LogRotation {
    fn from(arg: LogRotationArg) -> Self {
        match arg {
            LogRotationArg::Hourly => LogRotation::Hourly,
            LogRotationArg::Daily => LogRotation::Daily,
            LogRotationArg::Never => LogRotation::Never,
        }
    }
}
