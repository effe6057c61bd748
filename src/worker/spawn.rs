//! Worker subprocess spawning.
//!
//! Workers are this same executable re-invoked with the hidden `worker`
//! subcommand. stdin/stdout carry the request/response protocol; stderr is the
//! write end of the process-shared log queue.

use super::proc::Proc;
use crate::error::{HmullError, Result};
use crate::logging::queue::LogQueue;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Subcommand that puts the executable into worker mode.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// File descriptor, inside a worker, of the log queue's write end.
pub const LOG_QUEUE_FD: RawFd = 2;

/// Per-run configuration handed to every worker process at initialization.
///
/// Built once by the coordinator; every worker receives the same values and
/// therefore the same lock file and the same log queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// SQLite store the worker appends to.
    pub store_path: PathBuf,
    /// Lock file of the shared write mutex.
    pub lock_path: PathBuf,
    /// Log queue fd inherited from the coordinator. `None` logs to
    /// `log_path/worker-<pid>.log` instead.
    pub log_fd: Option<RawFd>,
    /// Log directory.
    pub log_path: PathBuf,
    /// tracing filter directive for the worker's subscriber.
    pub log_filter: String,
    /// Simulated work per job before the guarded section.
    pub work_delay_ms: u64,
    /// Record every guarded interval here.
    pub lock_trace_path: Option<PathBuf>,
}

/// Spawn a worker subprocess from `exe`.
pub fn spawn_worker(exe: &Path, queue: &LogQueue) -> Result<Proc> {
    let mut cmd = Command::new(exe);
    cmd.arg(WORKER_SUBCOMMAND);

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(queue.child_stdio()?);

    let child = cmd.spawn().map_err(|e| {
        HmullError::Worker(format!(
            "Failed to spawn worker '{}': {}",
            exe.display(),
            e
        ))
    })?;

    Proc::from_child(child)
}

/// Resolve the worker executable, defaulting to the running binary.
pub fn resolve_worker_exe(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_exe().map_err(|e| {
            HmullError::Worker(format!("Failed to get current executable: {}", e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_worker_exe_prefers_configured() {
        let exe = resolve_worker_exe(Some(Path::new("/opt/hmull/bin/hmull"))).unwrap();
        assert_eq!(exe, PathBuf::from("/opt/hmull/bin/hmull"));
    }

    #[test]
    fn test_resolve_worker_exe_defaults_to_current() {
        let exe = resolve_worker_exe(None).unwrap();
        assert_eq!(exe, std::env::current_exe().unwrap());
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let (queue, _consumer) = crate::logging::queue::channel().unwrap();
        let err = spawn_worker(Path::new("/nonexistent/hmull-worker"), &queue).unwrap_err();
        assert!(err.to_string().contains("Failed to spawn worker"));
    }
}
