//! The coordinator: owns the run's shared resources and drives the pool.
//!
//! Resources are acquired in a fixed order (store, write lock, log queue and
//! aggregator, worker pool) and released in exactly the reverse order, on
//! every exit path.

use crate::error::{HmullError, Result};
use crate::lock::SharedMutex;
use crate::logging::{AggregatorStats, LogAggregator, LogQueue, LogRouter, queue};
use crate::paths::AppPaths;
use crate::progress::ProgressReporter;
use crate::store::{Appender, Store};
use crate::worker::{Job, LOG_QUEUE_FD, PoolStats, WorkerConfig, WorkerPool, WorkerPoolConfig};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Jobs submitted to the pool before their results are collected.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Configuration for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub store_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_dir: PathBuf,
    /// Most jobs outstanding in the pool at once.
    pub batch_size: usize,
    pub pool: WorkerPoolConfig,
    /// Draw a progress bar while a run is in flight.
    pub show_progress: bool,
    /// Keep existing records instead of resetting the store at startup.
    pub keep_store: bool,
    /// Simulated work per job, before the lock is taken.
    pub work_delay_ms: u64,
    /// Record every guarded interval to this file.
    pub lock_trace: Option<PathBuf>,
    /// tracing filter handed to the workers.
    pub log_filter: String,
}

impl CoordinatorConfig {
    /// Defaults for the run directory described by `paths`.
    pub fn from_paths(paths: &AppPaths) -> Self {
        Self {
            store_path: paths.store_path.clone(),
            lock_path: paths.lock_path.clone(),
            log_dir: paths.log_dir.clone(),
            batch_size: DEFAULT_BATCH_SIZE,
            pool: WorkerPoolConfig::default(),
            show_progress: false,
            keep_store: false,
            work_delay_ms: 0,
            lock_trace: None,
            log_filter: "info".to_string(),
        }
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.pool.worker_count = count;
        self
    }

    pub fn with_worker_exe(mut self, exe: PathBuf) -> Self {
        self.pool.worker_exe = Some(exe);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_keep_store(mut self, keep: bool) -> Self {
        self.keep_store = keep;
        self
    }

    pub fn with_work_delay_ms(mut self, ms: u64) -> Self {
        self.work_delay_ms = ms;
        self
    }

    pub fn with_lock_trace(mut self, path: Option<PathBuf>) -> Self {
        self.lock_trace = path;
        self
    }

    pub fn with_log_filter(mut self, filter: String) -> Self {
        self.log_filter = filter;
        self
    }
}

/// Outcome of one verified [`Coordinator::process`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub jobs: u64,
    pub ops: u64,
    /// Records the workers reported writing.
    pub written: u64,
    /// Store count before the run.
    pub before: u64,
    /// Store count after the run.
    pub after: u64,
    /// Most jobs the pool has held at once.
    pub peak_outstanding: usize,
    pub elapsed: Duration,
}

/// Totals reported on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub pool: PoolStats,
    pub logs: AggregatorStats,
}

/// Owns the store, the write lock, the log pipeline and the worker pool.
pub struct Coordinator {
    config: CoordinatorConfig,
    router: LogRouter,
    next_job_id: u64,
    // Acquisition order; `teardown` releases bottom-up.
    store: Option<Store>,
    lock: Option<SharedMutex>,
    log_queue: Option<LogQueue>,
    aggregator: Option<LogAggregator>,
    pool: Option<WorkerPool>,
}

impl Coordinator {
    /// Acquire every resource for a run.
    ///
    /// On failure, whatever was already acquired is released in reverse order
    /// before the error is returned.
    #[instrument(level = "debug", skip_all)]
    pub fn new(config: CoordinatorConfig, router: &LogRouter) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(HmullError::InvalidRequest(
                "batch size must be at least 1".into(),
            ));
        }

        let mut coordinator = Self {
            config,
            router: router.clone(),
            next_job_id: 0,
            store: None,
            lock: None,
            log_queue: None,
            aggregator: None,
            pool: None,
        };
        coordinator.acquire(router)?;
        Ok(coordinator)
    }

    fn acquire(&mut self, router: &LogRouter) -> Result<()> {
        let config = &self.config;

        let store = Store::open(&config.store_path)?;
        if !config.keep_store {
            store.reset()?;
        }
        self.store = Some(store);

        self.lock = Some(SharedMutex::create(&config.lock_path)?);
        if let Some(trace) = &config.lock_trace {
            File::create(trace)?;
        }

        let (log_queue, consumer) = queue::channel()?;
        self.aggregator = Some(LogAggregator::start(&log_queue, consumer, router)?);

        let worker_config = Arc::new(WorkerConfig {
            store_path: config.store_path.clone(),
            lock_path: config.lock_path.clone(),
            log_fd: Some(LOG_QUEUE_FD),
            log_path: config.log_dir.clone(),
            log_filter: config.log_filter.clone(),
            work_delay_ms: config.work_delay_ms,
            lock_trace_path: config.lock_trace.clone(),
        });
        let pool = WorkerPool::spawn(&config.pool, worker_config, &log_queue);
        self.log_queue = Some(log_queue);
        self.pool = Some(pool?);

        info!(
            store = %self.config.store_path.display(),
            workers = self.config.pool.worker_count,
            batch_size = self.config.batch_size,
            "coordinator ready"
        );
        Ok(())
    }

    /// The coordinator's read-only store connection.
    pub fn store(&self) -> Result<&Store> {
        self.store.as_ref().ok_or(HmullError::ShutDown)
    }

    /// Run `jobs` jobs of `ops` records each and verify the store grew by
    /// exactly `jobs * ops`.
    ///
    /// Jobs are submitted `batch_size` at a time; a batch is fully collected
    /// before the next is submitted. The first failed job aborts the run:
    /// queued jobs are withdrawn, running ones are waited for, and the job's
    /// error is returned.
    #[instrument(level = "debug", skip(self))]
    pub fn process(&mut self, jobs: u64, ops: u64) -> Result<RunReport> {
        let expected = jobs.checked_mul(ops).ok_or_else(|| {
            HmullError::InvalidRequest(format!("{} jobs x {} ops overflows", jobs, ops))
        })?;
        let store = self.store.as_ref().ok_or(HmullError::ShutDown)?;
        let pool = self.pool.as_ref().ok_or(HmullError::ShutDown)?;
        let batch_size = self.config.batch_size as u64;

        let before = store.count()?;
        let progress = ProgressReporter::new(self.config.show_progress);
        progress.set_message(format!("{} jobs x {} ops", jobs, ops));
        let _console = self
            .config
            .show_progress
            .then(|| ConsoleProgress::attach(&self.router, &progress));
        let started = Instant::now();

        let mut written = 0u64;
        let mut submitted = 0u64;
        while submitted < jobs {
            let batch = batch_size.min(jobs - submitted);
            for _ in 0..batch {
                pool.submit(Job {
                    id: self.next_job_id,
                    item_count: ops,
                })?;
                self.next_job_id += 1;
            }
            progress.submit(batch * ops);
            submitted += batch;
            debug!(batch, submitted, "batch submitted");

            for _ in 0..batch {
                let outcome = pool.next_completed()?;
                let collected = outcome
                    .result
                    .and_then(|report| progress.update(report.written).map(|_| report));
                match collected {
                    Ok(report) => written += report.written,
                    Err(e) => {
                        error!(
                            job_id = outcome.job.id,
                            worker_id = outcome.worker_id,
                            error = %e,
                            "job failed, aborting run"
                        );
                        abort_in_flight(pool);
                        progress.finish();
                        return Err(e);
                    }
                }
            }
        }
        progress.finish();

        let after = store.count()?;
        let actual = after.saturating_sub(before);
        if actual != expected || after < before {
            error!(expected, actual, before, after, "store count mismatch");
            return Err(HmullError::InvariantViolation { expected, actual });
        }

        let report = RunReport {
            jobs,
            ops,
            written,
            before,
            after,
            peak_outstanding: pool.peak_outstanding(),
            elapsed: started.elapsed(),
        };
        info!(
            jobs,
            ops,
            written,
            total = after,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run verified"
        );
        Ok(report)
    }

    /// Release every resource and report totals.
    pub fn shutdown(mut self) -> Result<CoordinatorStats> {
        self.teardown()
    }

    /// Release resources in reverse acquisition order. Idempotent.
    fn teardown(&mut self) -> Result<CoordinatorStats> {
        let mut stats = CoordinatorStats::default();
        let mut first_error = None;

        if let Some(pool) = self.pool.take() {
            stats.pool = pool.shutdown();
        }
        if let Some(aggregator) = self.aggregator.take() {
            match aggregator.stop() {
                Ok(logs) => stats.logs = logs,
                Err(e) => first_error = Some(e),
            }
        }
        self.log_queue.take();
        self.lock.take();
        self.store.take();

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(
                    jobs = stats.pool.jobs_completed,
                    log_records = stats.logs.forwarded,
                    "coordinator shut down"
                );
                Ok(stats)
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(error = %e, "coordinator teardown failed");
        }
    }
}

/// Keeps console log lines clear of the progress bar until dropped.
struct ConsoleProgress<'a> {
    router: &'a LogRouter,
}

impl<'a> ConsoleProgress<'a> {
    fn attach(router: &'a LogRouter, progress: &ProgressReporter) -> Self {
        router.attach_progress(progress.bar());
        Self { router }
    }
}

impl Drop for ConsoleProgress<'_> {
    fn drop(&mut self) {
        self.router.detach_progress();
    }
}

/// Withdraw queued jobs and wait for the ones already running.
fn abort_in_flight(pool: &WorkerPool) {
    let reclaimed = pool.reclaim_pending();
    let mut drained = 0usize;
    while pool.outstanding() > 0 {
        match pool.next_completed() {
            Ok(_) => drained += 1,
            Err(_) => break,
        }
    }
    warn!(
        reclaimed = reclaimed.len(),
        drained, "aborted in-flight jobs"
    );
}

/// Run sizes for a sweep: `start, start + step, ...` below `stop`.
pub fn sweep_sizes(start: u64, stop: u64, step: u64) -> Result<Vec<u64>> {
    if step == 0 {
        return Err(HmullError::InvalidRequest("sweep step must be positive".into()));
    }
    Ok((start..stop).step_by(step as usize).collect())
}
