//! Worker processes and the pool that drives them.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │   Coordinator    │
//!                     │  (WorkerPool)    │
//!                     └────────┬─────────┘
//!              stdin/stdout    │ one dispatcher thread per worker
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!               └──── stderr = log queue ─────┘
//! ```
//!
//! Each worker is the `hmull` binary re-invoked as `hmull worker`. It is
//! initialized exactly once with a [`WorkerConfig`], then appends records to
//! the shared store under the shared write lock for every job it receives.

pub mod context;
pub mod ipc;
pub mod pool;
pub mod proc;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod worker_main;

pub use context::WorkerContext;
pub use pool::{Job, JobOutcome, JobReport, PoolStats, WorkerPool, WorkerPoolConfig};
pub use protocol::{WorkRequest, WorkResponse};
pub use spawn::{LOG_QUEUE_FD, WORKER_SUBCOMMAND, WorkerConfig};
pub use worker_main::{EXIT_FATAL, run_worker_main};
