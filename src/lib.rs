//! hmull - parallel writer processes over one shared SQLite store.
//!
//! A [`Coordinator`](coordinator::Coordinator) spawns a fixed pool of worker
//! processes, hands each the same [`WorkerConfig`](worker::WorkerConfig), and
//! submits jobs in bounded batches. Every worker write goes through a
//! [`SerializedAppender`](store::SerializedAppender), which holds the
//! cross-process [`SharedMutex`](lock::SharedMutex) for the whole
//! transaction. Worker log records travel over one process-shared pipe to a
//! single [`LogAggregator`](logging::LogAggregator) thread. After each run
//! the coordinator checks that the store grew by exactly `jobs * ops`.

pub mod cli;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod store;
pub mod worker;

pub use error::{HmullError, Result};
