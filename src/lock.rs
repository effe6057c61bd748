//! Cross-process exclusive lock guarding the store's write path.
//!
//! The lock is an advisory `flock(2)` on a shared lock file. Every acquisition
//! opens its own file description, so the lock excludes other threads of the
//! same process as well as other processes. It is not reentrant: acquiring it
//! twice from one thread deadlocks.
//!
//! Known limitation: there is no timeout on [`SharedMutex::acquire`]. A holder
//! that never returns stalls every other writer.

use crate::error::{HmullError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Handle to the shared write lock.
///
/// Cheap to clone; every clone refers to the same lock file and therefore the
/// same lock.
#[derive(Debug, Clone)]
pub struct SharedMutex {
    path: PathBuf,
    trace_path: Option<PathBuf>,
}

impl SharedMutex {
    /// Create the lock file (if missing) and return a handle to it.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                HmullError::Lock(format!("cannot create '{}': {}", path.display(), e))
            })?;
        Ok(Self {
            path,
            trace_path: None,
        })
    }

    /// Open a handle to a lock file created by the coordinator.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(HmullError::Lock(format!(
                "lock file '{}' does not exist",
                path.display()
            )));
        }
        Ok(Self {
            path,
            trace_path: None,
        })
    }

    /// Record every guarded interval to `trace_path` (one JSON line per release).
    pub fn with_trace(mut self, trace_path: Option<PathBuf>) -> Self {
        self.trace_path = trace_path;
        self
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until exclusive ownership is obtained.
    pub fn acquire(&self) -> Result<WriteGuard<'_>> {
        let mut file = self.open_file()?;
        let lock = loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(lock) => break lock,
                Err((f, Errno::EINTR)) => file = f,
                Err((_, e)) => {
                    return Err(HmullError::Lock(format!(
                        "flock '{}' failed: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        };
        trace!(lock = %self.path.display(), "acquired store lock");
        Ok(WriteGuard {
            mutex: self,
            lock: Some(lock),
            entered_ns: now_ns(),
        })
    }

    fn open_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| HmullError::Lock(format!("cannot open '{}': {}", self.path.display(), e)))
    }
}

/// Proof of exclusive ownership of the [`SharedMutex`].
///
/// Released on [`WriteGuard::release`] or drop.
pub struct WriteGuard<'a> {
    mutex: &'a SharedMutex,
    lock: Option<Flock<File>>,
    entered_ns: i64,
}

impl WriteGuard<'_> {
    /// Relinquish ownership, reporting any unlock failure.
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };

        // Trace is written while still holding the lock.
        let traced = match &self.mutex.trace_path {
            Some(path) => append_span(
                path,
                &LockSpan {
                    pid: std::process::id(),
                    enter_ns: self.entered_ns,
                    exit_ns: now_ns(),
                },
            ),
            None => Ok(()),
        };

        lock.unlock()
            .map_err(|(_, e)| HmullError::Lock(format!("unlock failed: {}", e)))?;
        trace!(lock = %self.mutex.path.display(), "released store lock");
        traced
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// One guarded interval recorded by an instrumented lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpan {
    pub pid: u32,
    pub enter_ns: i64,
    pub exit_ns: i64,
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn append_span(path: &Path, span: &LockSpan) -> Result<()> {
    let mut line = serde_json::to_string(span)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Read every span recorded in a lock trace file.
pub fn read_trace<P: AsRef<Path>>(path: P) -> Result<Vec<LockSpan>> {
    let reader = BufReader::new(File::open(path)?);
    let mut spans = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        spans.push(serde_json::from_str(&line)?);
    }
    Ok(spans)
}

/// Return the first pair of spans whose guarded intervals overlap, if any.
pub fn find_overlap(spans: &[LockSpan]) -> Option<(LockSpan, LockSpan)> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.enter_ns);
    sorted
        .windows(2)
        .find(|w| w[1].enter_ns < w[0].exit_ns)
        .map(|w| (w[0], w[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_open_requires_existing_file() {
        let tmp = tempdir().unwrap();
        let err = SharedMutex::open(tmp.path().join("missing.lock")).unwrap_err();
        assert!(matches!(err, HmullError::Lock(_)));
    }

    #[test]
    fn test_acquire_release() {
        let tmp = tempdir().unwrap();
        let mutex = SharedMutex::create(tmp.path().join("store.lock")).unwrap();
        let guard = mutex.acquire().unwrap();
        guard.release().unwrap();
        // Reacquire after release
        drop(mutex.acquire().unwrap());
    }

    #[test]
    fn test_excludes_concurrent_holders() {
        let tmp = tempdir().unwrap();
        let mutex = SharedMutex::create(tmp.path().join("store.lock")).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..10 {
                        let guard = mutex.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        guard.release().unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trace_records_non_overlapping_spans() {
        let tmp = tempdir().unwrap();
        let trace_path = tmp.path().join("lock.trace");
        let mutex = SharedMutex::create(tmp.path().join("store.lock"))
            .unwrap()
            .with_trace(Some(trace_path.clone()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        let _guard = mutex.acquire().unwrap();
                        thread::sleep(Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let spans = read_trace(&trace_path).unwrap();
        assert_eq!(spans.len(), 15);
        assert!(spans.iter().all(|s| s.exit_ns >= s.enter_ns));
        assert_eq!(find_overlap(&spans), None);
    }

    #[test]
    fn test_find_overlap_detects_overlap() {
        let spans = [
            LockSpan {
                pid: 1,
                enter_ns: 0,
                exit_ns: 10,
            },
            LockSpan {
                pid: 2,
                enter_ns: 20,
                exit_ns: 30,
            },
            LockSpan {
                pid: 3,
                enter_ns: 25,
                exit_ns: 40,
            },
        ];
        let (a, b) = find_overlap(&spans).unwrap();
        assert_eq!(a.pid, 2);
        assert_eq!(b.pid, 3);
    }
}
