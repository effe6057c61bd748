//! Process-shared log queue.
//!
//! One OS pipe: many writers (the coordinator and every worker, which
//! inherit the write end as stderr), one reader (the aggregator's listener).
//! Each record is a single `write(2)` of at most `PIPE_BUF` bytes, so records
//! from different processes never interleave inside a line. The write end is
//! non-blocking: when the pipe is full a record is dropped rather than stalling
//! a job.

use crate::error::Result;
use crate::worker::ipc::{LineReader, PipeFd};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use std::io::{self, Write};
use std::os::unix::io::{AsFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

/// Record that tells the listener to stop.
pub(crate) const SENTINEL: &str = "\u{0}hmull-log-queue-stop";

/// Largest record (including its newline) written atomically.
pub fn max_record_bytes() -> usize {
    nix::libc::PIPE_BUF
}

/// Write-side handle of the queue. Clones share the same pipe.
#[derive(Clone)]
pub struct LogQueue {
    writer: Arc<OwnedFd>,
}

/// Read side of the queue, owned by exactly one listener.
pub struct LogConsumer {
    reader: LineReader,
}

/// Create a queue.
pub fn channel() -> Result<(LogQueue, LogConsumer)> {
    let (read_fd, write_fd) = nix::unistd::pipe().map_err(io::Error::from)?;
    set_cloexec(&read_fd)?;
    set_cloexec(&write_fd)?;
    fcntl(&write_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;

    Ok((
        LogQueue {
            writer: Arc::new(write_fd),
        },
        LogConsumer {
            reader: LineReader::new(PipeFd::new(read_fd)),
        },
    ))
}

fn set_cloexec<F: AsFd>(fd: F) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
}

impl LogQueue {
    /// A producer writing into this queue.
    pub fn producer(&self) -> Result<LogProducer> {
        Ok(LogProducer::new(self.writer.try_clone()?))
    }

    /// The write end as a child's stdio.
    pub fn child_stdio(&self) -> Result<Stdio> {
        Ok(Stdio::from(self.writer.try_clone()?))
    }
}

impl LogConsumer {
    /// Next record, or `None` once every writer has closed the pipe.
    pub fn next_record(&mut self) -> io::Result<Option<&str>> {
        self.reader.read_line()
    }
}

/// Count of records a producer dropped; clones share the count.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Best-effort writer into a log queue.
pub struct LogProducer {
    fd: OwnedFd,
    dropped: DropCounter,
}

impl LogProducer {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            dropped: DropCounter::default(),
        }
    }

    /// Enqueue one record without blocking.
    ///
    /// Returns `false` if the record was dropped (queue full or closed).
    pub fn enqueue(&self, record: &[u8]) -> bool {
        let framed = frame(record);
        loop {
            match nix::unistd::write(&self.fd, &framed) {
                Ok(_) => return true,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.dropped.incr();
                    return false;
                }
            }
        }
    }

    /// Enqueue one record, retrying while the queue is full.
    pub(crate) fn enqueue_blocking(&self, record: &[u8]) -> io::Result<()> {
        let framed = frame(record);
        loop {
            match nix::unistd::write(&self.fd, &framed) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    /// Records this producer has dropped.
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    /// A handle that keeps reading this producer's drop count after the
    /// producer has been moved into a subscriber.
    pub fn drop_counter(&self) -> DropCounter {
        self.dropped.clone()
    }
}

/// Strip trailing newlines, truncate to fit one atomic write, append `\n`.
fn frame(record: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(record);
    let text = text.trim_end_matches(['\n', '\r']);

    let limit = max_record_bytes() - 1;
    let mut cut = text.len().min(limit);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut framed = Vec::with_capacity(cut + 1);
    framed.extend_from_slice(&text.as_bytes()[..cut]);
    framed.push(b'\n');
    framed
}

/// `io::Write` adapter: every `write` call is one record.
pub struct ProducerWriter<'a>(&'a LogProducer);

impl Write for ProducerWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Dropped records are not an error to the caller.
        self.0.enqueue(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogProducer {
    type Writer = ProducerWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        ProducerWriter(self)
    }
}
