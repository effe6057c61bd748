//! Log aggregation: one listener thread drains the log queue into the sinks.

use super::queue::{LogConsumer, LogProducer, LogQueue, SENTINEL};
use super::router::{LogRouter, LogSink};
use crate::error::{HmullError, Result};
use std::io::Write;
use std::thread::{self, JoinHandle};

/// Counters reported when an aggregator stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Records written to the sinks.
    pub forwarded: u64,
    /// Coordinator records dropped because the queue was full. Worker drops
    /// are reported by the pool ([`PoolStats::worker_log_dropped`]).
    ///
    /// [`PoolStats::worker_log_dropped`]: crate::worker::PoolStats::worker_log_dropped
    pub dropped: u64,
}

struct ListenerExit {
    sinks: Vec<LogSink>,
    forwarded: u64,
}

/// Drains a [`LogQueue`] into the sinks of a [`LogRouter`].
///
/// While running, the router's sinks belong to the listener thread and the
/// router itself feeds the queue, so every record from every process is
/// written exactly once by a single thread.
pub struct LogAggregator {
    router: LogRouter,
    control: LogProducer,
    listener: Option<JoinHandle<ListenerExit>>,
}

impl LogAggregator {
    /// Divert `router` into `queue` and start the listener.
    pub fn start(queue: &LogQueue, consumer: LogConsumer, router: &LogRouter) -> Result<Self> {
        let control = queue.producer()?;
        let sinks = router.divert(queue.producer()?)?;

        let spawned = thread::Builder::new()
            .name("log-listener".into())
            .spawn(move || listen(consumer, sinks));

        match spawned {
            Ok(handle) => Ok(Self {
                router: router.clone(),
                control,
                listener: Some(handle),
            }),
            Err(e) => {
                // The sinks went down with the closure; fall back to stderr.
                router.hold();
                router.restore(vec![Box::new(std::io::stderr())]);
                Err(HmullError::Logging(format!(
                    "Failed to start log listener: {}",
                    e
                )))
            }
        }
    }

    /// Whether the listener thread is still draining the queue.
    pub fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the listener after it has drained everything enqueued so far and
    /// hand the sinks back to the router.
    pub fn stop(mut self) -> Result<AggregatorStats> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<AggregatorStats> {
        let Some(handle) = self.listener.take() else {
            return Ok(AggregatorStats::default());
        };

        // Records logged from here until restore are buffered by the router.
        let dropped = self.router.hold().map(|p| p.dropped()).unwrap_or(0);

        // A dead listener has closed the read end; the write fails with EPIPE.
        let sent = self.control.enqueue_blocking(SENTINEL.as_bytes());

        match handle.join() {
            Ok(exit) => {
                self.router.restore(exit.sinks);
                sent.map_err(|e| {
                    HmullError::Logging(format!("Failed to signal log listener: {}", e))
                })?;
                Ok(AggregatorStats {
                    forwarded: exit.forwarded,
                    dropped,
                })
            }
            Err(_) => {
                self.router.restore(vec![Box::new(std::io::stderr())]);
                Err(HmullError::Logging("log listener panicked".into()))
            }
        }
    }
}

impl Drop for LogAggregator {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn listen(mut consumer: LogConsumer, mut sinks: Vec<LogSink>) -> ListenerExit {
    let mut forwarded = 0u64;
    loop {
        match consumer.next_record() {
            Ok(Some(line)) if line == SENTINEL => break,
            Ok(Some(line)) => {
                for sink in sinks.iter_mut() {
                    let _ = sink.write_all(line.as_bytes());
                    let _ = sink.write_all(b"\n");
                }
                forwarded += 1;
            }
            // Every writer is gone.
            Ok(None) => break,
            Err(_) => break,
        }
    }
    for sink in sinks.iter_mut() {
        let _ = sink.flush();
    }
    ListenerExit { sinks, forwarded }
}
