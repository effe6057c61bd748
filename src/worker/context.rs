//! Per-process worker state, built once by `init`.

use super::spawn::WorkerConfig;
use crate::error::Result;
use crate::lock::SharedMutex;
use crate::store::{AppendOutcome, SerializedAppender, Store};
use std::time::Duration;
use tracing::{Span, debug, info, info_span};

/// Everything a worker process needs to run jobs.
///
/// Owns the process's store connection and lock handle for its lifetime.
pub struct WorkerContext {
    appender: SerializedAppender<Store>,
    work_delay: Duration,
    jobs_processed: u64,
    span: Span,
}

impl WorkerContext {
    /// Open the store and lock named by `config`.
    ///
    /// The coordinator has already created both; a worker never creates them.
    pub fn init(config: &WorkerConfig) -> Result<Self> {
        let span = info_span!("worker", pid = std::process::id());
        let (store, lock) = span.in_scope(|| -> Result<_> {
            let store = Store::open_existing(&config.store_path)?;
            let lock = SharedMutex::open(&config.lock_path)?
                .with_trace(config.lock_trace_path.clone());
            info!(
                store = %config.store_path.display(),
                lock = %config.lock_path.display(),
                "worker initialized"
            );
            Ok((store, lock))
        })?;

        Ok(Self {
            appender: SerializedAppender::new(store, lock),
            work_delay: Duration::from_millis(config.work_delay_ms),
            jobs_processed: 0,
            span,
        })
    }

    /// Run one job: simulate work, then append `item_count` records under the
    /// shared lock.
    pub fn process(&mut self, job_id: u64, item_count: u64) -> Result<AppendOutcome> {
        let _enter = self.span.enter();

        if !self.work_delay.is_zero() {
            std::thread::sleep(self.work_delay);
        }

        debug!(job_id, item_count, "job started");
        let outcome = self.appender.append_generated(item_count)?;
        self.jobs_processed += 1;
        info!(
            pid = std::process::id(),
            seq = self.jobs_processed,
            job_id,
            written = outcome.written,
            total = outcome.total,
            "job committed"
        );
        Ok(outcome)
    }

    /// Jobs committed by this process.
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed
    }
}
