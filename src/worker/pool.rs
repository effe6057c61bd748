//! Pool of worker processes.
//!
//! Each worker process is driven by one dispatcher thread. Jobs go out on a
//! shared task channel, so an idle worker picks up the next job; outcomes come
//! back on a single result channel in completion order.

use super::proc::Proc;
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use super::spawn::{WorkerConfig, resolve_worker_exe, spawn_worker};
use crate::error::{HmullError, Result};
use crate::logging::queue::LogQueue;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Upper bound for the default worker count.
const MAX_DEFAULT_WORKERS: usize = 8;

/// Default worker count: available parallelism, clamped to `1..=8`.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_DEFAULT_WORKERS)
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker processes to spawn.
    pub worker_count: usize,
    /// Executable to run as `<exe> worker` (default: the running binary).
    pub worker_exe: Option<PathBuf>,
    /// How long a worker gets to exit after `exit` before it is signaled.
    pub stop_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            worker_exe: None,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// One unit of work: write `item_count` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub item_count: u64,
}

/// A committed job as reported by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: u64,
    pub worker_id: usize,
    pub pid: u32,
    pub written: u64,
    pub total: u64,
    /// Log records the worker had dropped when it reported this job.
    pub log_dropped: u64,
}

/// Result of one submitted job.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub worker_id: usize,
    pub result: Result<JobReport>,
}

/// Statistics returned when the pool shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of workers in the pool.
    pub worker_count: usize,
    /// Jobs committed by all workers.
    pub jobs_completed: usize,
    /// Most jobs ever submitted but not yet collected.
    pub peak_outstanding: usize,
    /// Log records the workers dropped, as of their last reported job.
    pub worker_log_dropped: u64,
}

/// A single worker in the pool.
struct PoolWorker {
    id: usize,
    /// None once the process has died; it is never respawned.
    proc: Option<Proc>,
    jobs_completed: usize,
    log_dropped: u64,
}

impl PoolWorker {
    fn new(id: usize, proc: Proc) -> Self {
        Self {
            id,
            proc: Some(proc),
            jobs_completed: 0,
            log_dropped: 0,
        }
    }

    /// Send `init` and wait for `ready`.
    fn init(&mut self, config: &WorkerConfig) -> Result<()> {
        let sent = self.proc_mut()?.send(&WorkRequest::Init {
            config: config.clone(),
        });
        if sent.is_err() {
            return Err(self.handle_death("before init"));
        }

        let response = self.proc_mut()?.recv()?;
        match response {
            Some(WorkResponse::Ready) => Ok(()),
            Some(WorkResponse::Error { message, .. }) => Err(HmullError::Worker(format!(
                "Worker {} failed to initialize: {}",
                self.id, message
            ))),
            Some(other) => Err(HmullError::Worker(format!(
                "Worker {} sent unexpected response instead of Ready: {:?}",
                self.id, other
            ))),
            None => Err(self.handle_death("during init")),
        }
    }

    /// Run one job to completion on this worker.
    fn run(&mut self, job: Job) -> Result<JobReport> {
        let sent = self
            .proc_mut()?
            .send(&WorkRequest::process(job.id, job.item_count));
        if sent.is_err() {
            return Err(self.handle_death("while sending a job"));
        }

        let response = self.proc_mut()?.recv()?;
        match response {
            Some(WorkResponse::Done {
                job_id,
                written,
                total,
                pid,
                log_dropped,
            }) if job_id == job.id => {
                self.jobs_completed += 1;
                self.log_dropped = log_dropped;
                Ok(JobReport {
                    job_id,
                    worker_id: self.id,
                    pid,
                    written,
                    total,
                    log_dropped,
                })
            }
            Some(WorkResponse::Error { message, .. }) => Err(HmullError::JobFailed {
                job_id: job.id,
                message,
            }),
            Some(other) => Err(HmullError::Worker(format!(
                "Worker {} sent unexpected response to job {}: {:?}",
                self.id, job.id, other
            ))),
            None => Err(self.handle_death("during a job")),
        }
    }

    fn proc_mut(&mut self) -> Result<&mut Proc> {
        self.proc.as_mut().ok_or_else(|| HmullError::WorkerDied {
            worker_id: self.id,
            reason: "process is no longer running".into(),
        })
    }

    /// Reap a dead worker and describe why it died.
    fn handle_death(&mut self, context: &str) -> HmullError {
        let reason = match self.proc.take() {
            Some(mut proc) => match proc.wait_timeout(Duration::from_secs(1)) {
                Ok(Some(status)) => analyze_wait_status(status),
                Ok(None) => TerminationReason::StillAlive,
                Err(_) => TerminationReason::Unknown,
            },
            None => TerminationReason::Unknown,
        };

        warn!(
            worker_id = self.id,
            reason = %reason,
            context = context,
            "Worker died unexpectedly"
        );

        HmullError::WorkerDied {
            worker_id: self.id,
            reason: format!("{} {}", reason, context),
        }
    }

    /// Shutdown the worker gracefully.
    fn shutdown(&mut self, timeout: Duration) {
        if let Some(mut proc) = self.proc.take() {
            let _ = proc.stop(timeout);
        }
    }
}

/// Totals one dispatcher hands back when its worker stops.
#[derive(Debug, Clone, Copy, Default)]
struct WorkerTotals {
    jobs_completed: usize,
    log_dropped: u64,
}

/// Dispatcher thread body: feed jobs to one worker until the task channel closes.
fn dispatch(
    mut worker: PoolWorker,
    tasks: Receiver<Job>,
    results: Sender<JobOutcome>,
    stop_timeout: Duration,
) -> WorkerTotals {
    for job in tasks.iter() {
        debug!(worker_id = worker.id, job_id = job.id, "dispatching job");
        let result = worker.run(job);
        let outcome = JobOutcome {
            job,
            worker_id: worker.id,
            result,
        };
        if results.send(outcome).is_err() {
            break;
        }
    }
    worker.shutdown(stop_timeout);
    WorkerTotals {
        jobs_completed: worker.jobs_completed,
        log_dropped: worker.log_dropped,
    }
}

/// A pool of worker subprocesses sharing one task queue.
pub struct WorkerPool {
    tasks: Option<Sender<Job>>,
    /// Kept so jobs not yet picked up can be withdrawn.
    pending: Receiver<Job>,
    results: Receiver<JobOutcome>,
    dispatchers: Vec<JoinHandle<WorkerTotals>>,
    worker_count: usize,
    outstanding: AtomicUsize,
    peak_outstanding: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers and initialize each with `worker_config`.
    ///
    /// Every worker inherits `queue` as its stderr.
    #[instrument(level = "debug", skip_all, fields(workers = config.worker_count))]
    pub fn spawn(
        config: &WorkerPoolConfig,
        worker_config: Arc<WorkerConfig>,
        queue: &LogQueue,
    ) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(HmullError::Worker("worker pool needs at least one worker".into()));
        }
        let exe = resolve_worker_exe(config.worker_exe.as_deref())?;

        info!(
            workers = config.worker_count,
            exe = %exe.display(),
            "Initializing worker pool"
        );

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            workers.push(PoolWorker::new(id, spawn_worker(&exe, queue)?));
        }
        for worker in workers.iter_mut() {
            worker.init(&worker_config)?;
        }

        info!(workers = config.worker_count, "All workers ready");

        let (task_tx, task_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = unbounded::<JobOutcome>();

        let mut dispatchers = Vec::with_capacity(workers.len());
        for worker in workers {
            let tasks = task_rx.clone();
            let results = result_tx.clone();
            let stop_timeout = config.stop_timeout;
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{}", worker.id))
                .spawn(move || dispatch(worker, tasks, results, stop_timeout))
                .map_err(|e| HmullError::Worker(format!("Failed to start dispatcher: {}", e)))?;
            dispatchers.push(handle);
        }

        Ok(Self {
            tasks: Some(task_tx),
            pending: task_rx,
            results: result_rx,
            dispatchers,
            worker_count: config.worker_count,
            outstanding: AtomicUsize::new(0),
            peak_outstanding: AtomicUsize::new(0),
        })
    }

    /// Get the number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue a job for the next idle worker.
    pub fn submit(&self, job: Job) -> Result<()> {
        let tasks = self.tasks.as_ref().ok_or(HmullError::ShutDown)?;
        tasks.send(job).map_err(|_| HmullError::ShutDown)?;
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_outstanding.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    /// Block until some outstanding job finishes.
    pub fn next_completed(&self) -> Result<JobOutcome> {
        if self.outstanding() == 0 {
            return Err(HmullError::Worker("no jobs outstanding".into()));
        }
        let outcome = self
            .results
            .recv()
            .map_err(|_| HmullError::Worker("all workers have exited".into()))?;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }

    /// Withdraw every job no worker has started yet.
    pub fn reclaim_pending(&self) -> Vec<Job> {
        let reclaimed: Vec<Job> = self.pending.try_iter().collect();
        if !reclaimed.is_empty() {
            self.outstanding
                .fetch_sub(reclaimed.len(), Ordering::SeqCst);
            debug!(jobs = reclaimed.len(), "reclaimed pending jobs");
        }
        reclaimed
    }

    /// Jobs submitted but not yet collected.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Highest value [`outstanding`](Self::outstanding) has reached.
    pub fn peak_outstanding(&self) -> usize {
        self.peak_outstanding.load(Ordering::SeqCst)
    }

    /// Stop every worker and wait for the dispatchers.
    ///
    /// Jobs already running finish first; queued jobs are discarded.
    pub fn shutdown(mut self) -> PoolStats {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> PoolStats {
        let Some(tasks) = self.tasks.take() else {
            return PoolStats {
                worker_count: self.worker_count,
                peak_outstanding: self.peak_outstanding(),
                ..PoolStats::default()
            };
        };
        self.reclaim_pending();
        drop(tasks);

        let mut stats = PoolStats {
            worker_count: self.worker_count,
            peak_outstanding: self.peak_outstanding(),
            ..PoolStats::default()
        };
        for handle in self.dispatchers.drain(..) {
            match handle.join() {
                Ok(totals) => {
                    stats.jobs_completed += totals.jobs_completed;
                    stats.worker_log_dropped += totals.log_dropped;
                }
                Err(_) => warn!("worker dispatcher panicked"),
            }
        }

        info!(
            workers = stats.worker_count,
            jobs = stats.jobs_completed,
            peak_outstanding = stats.peak_outstanding,
            log_dropped = stats.worker_log_dropped,
            "Worker pool shut down"
        );
        stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
