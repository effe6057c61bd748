//! Switchable writer behind the coordinator's tracing subscriber.
//!
//! Normally the router writes formatted records straight to its sinks
//! (stderr, log file). While a [`LogAggregator`](super::aggregator::LogAggregator)
//! is active the sinks are handed to the aggregator's listener and the router
//! forwards coordinator records into the log queue instead, so coordinator and
//! worker records reach the same sinks once, in queue order.

use super::queue::LogProducer;
use crate::error::{HmullError, Result};
use indicatif::ProgressBar;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// A final log destination.
pub type LogSink = Box<dyn Write + Send>;

enum Route {
    /// Write to the attached sinks.
    Direct(Vec<LogSink>),
    /// Forward into the log queue.
    Diverted(LogProducer),
    /// Buffer while the aggregator hands the sinks back.
    Holding(Vec<Vec<u8>>),
}

/// Progress bar currently drawn on stderr, if any.
type ProgressSlot = Arc<Mutex<Option<ProgressBar>>>;

/// Cloneable handle; all clones share one route.
#[derive(Clone)]
pub struct LogRouter {
    route: Arc<Mutex<Route>>,
    progress: ProgressSlot,
}

impl LogRouter {
    pub fn new(sinks: Vec<LogSink>) -> Self {
        Self {
            route: Arc::new(Mutex::new(Route::Direct(sinks))),
            progress: ProgressSlot::default(),
        }
    }

    /// A router writing to stderr first, then to `sinks`.
    ///
    /// Its stderr sink clears any attached progress bar around each record.
    pub fn with_console(sinks: Vec<LogSink>) -> Self {
        let progress = ProgressSlot::default();
        let mut all: Vec<LogSink> = vec![Box::new(ConsoleSink {
            progress: progress.clone(),
        })];
        all.extend(sinks);
        Self {
            route: Arc::new(Mutex::new(Route::Direct(all))),
            progress,
        }
    }

    /// Keep `bar` off the lines this router's console sink writes.
    pub fn attach_progress(&self, bar: ProgressBar) {
        *lock_slot(&self.progress) = Some(bar);
    }

    pub fn detach_progress(&self) {
        lock_slot(&self.progress).take();
    }

    pub fn has_progress(&self) -> bool {
        lock_slot(&self.progress).is_some()
    }

    fn route(&self) -> MutexGuard<'_, Route> {
        // A panic mid-write must not disable logging for the rest of the run.
        self.route.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver one formatted record along the current route.
    pub fn write_record(&self, buf: &[u8]) -> io::Result<()> {
        match &mut *self.route() {
            Route::Direct(sinks) => {
                for sink in sinks.iter_mut() {
                    sink.write_all(buf)?;
                }
                Ok(())
            }
            Route::Diverted(producer) => {
                producer.enqueue(buf);
                Ok(())
            }
            Route::Holding(held) => {
                held.push(buf.to_vec());
                Ok(())
            }
        }
    }

    /// Whether records currently flow into a log queue.
    pub fn is_diverted(&self) -> bool {
        !matches!(&*self.route(), Route::Direct(_))
    }

    /// Detach the sinks and forward records through `producer` instead.
    pub(crate) fn divert(&self, producer: LogProducer) -> Result<Vec<LogSink>> {
        let mut route = self.route();
        match std::mem::replace(&mut *route, Route::Diverted(producer)) {
            Route::Direct(sinks) => Ok(sinks),
            previous => {
                *route = previous;
                Err(HmullError::Logging(
                    "log router is already diverted to a queue".into(),
                ))
            }
        }
    }

    /// Stop forwarding into the queue and buffer records until [`restore`].
    ///
    /// Returns the producer that was in use, if any.
    ///
    /// [`restore`]: LogRouter::restore
    pub(crate) fn hold(&self) -> Option<LogProducer> {
        let mut route = self.route();
        match std::mem::replace(&mut *route, Route::Holding(Vec::new())) {
            Route::Diverted(producer) => Some(producer),
            previous => {
                *route = previous;
                None
            }
        }
    }

    /// Reattach `sinks`, flushing anything buffered while holding.
    pub(crate) fn restore(&self, mut sinks: Vec<LogSink>) {
        let mut route = self.route();
        if let Route::Holding(held) = &*route {
            for record in held {
                for sink in sinks.iter_mut() {
                    let _ = sink.write_all(record);
                }
            }
        }
        for sink in sinks.iter_mut() {
            let _ = sink.flush();
        }
        *route = Route::Direct(sinks);
    }
}

/// `io::Write` adapter handed out to the fmt layer.
pub struct RouteWriter<'a>(&'a LogRouter);

impl Write for RouteWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogRouter {
    type Writer = RouteWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RouteWriter(self)
    }
}

fn lock_slot(slot: &ProgressSlot) -> MutexGuard<'_, Option<ProgressBar>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// stderr sink that suspends an attached progress bar while it writes.
pub struct ConsoleSink {
    progress: ProgressSlot,
}

impl Write for ConsoleSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Clone out so the slot is not held while the bar redraws.
        let bar = lock_slot(&self.progress).clone();
        match bar {
            Some(bar) => bar.suspend(|| io::stderr().write_all(buf))?,
            None => io::stderr().write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// In-memory sink, shared between clones.
#[derive(Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::queue;

    #[test]
    fn test_direct_route_writes_every_sink() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let router = LogRouter::new(vec![Box::new(a.clone()), Box::new(b.clone())]);

        router.write_record(b"hello\n").unwrap();
        assert_eq!(a.contents(), "hello\n");
        assert_eq!(b.contents(), "hello\n");
        assert!(!router.is_diverted());
    }

    #[test]
    fn test_divert_forwards_into_queue() {
        let sink = MemorySink::new();
        let router = LogRouter::new(vec![Box::new(sink.clone())]);
        let (queue, mut consumer) = queue::channel().unwrap();

        let sinks = router.divert(queue.producer().unwrap()).unwrap();
        assert_eq!(sinks.len(), 1);
        assert!(router.is_diverted());

        router.write_record(b"via queue\n").unwrap();
        assert_eq!(sink.contents(), "");
        assert_eq!(consumer.next_record().unwrap(), Some("via queue"));
    }

    #[test]
    fn test_second_divert_is_rejected() {
        let router = LogRouter::new(Vec::new());
        let (queue, _consumer) = queue::channel().unwrap();
        router.divert(queue.producer().unwrap()).unwrap();
        assert!(matches!(
            router.divert(queue.producer().unwrap()),
            Err(HmullError::Logging(_))
        ));
    }

    #[test]
    fn test_hold_then_restore_flushes_buffered_records() {
        let sink = MemorySink::new();
        let router = LogRouter::new(vec![Box::new(sink.clone())]);
        let (queue, _consumer) = queue::channel().unwrap();

        let sinks = router.divert(queue.producer().unwrap()).unwrap();
        assert!(router.hold().is_some());
        router.write_record(b"held\n").unwrap();
        assert_eq!(sink.contents(), "");

        router.restore(sinks);
        assert_eq!(sink.contents(), "held\n");
        assert!(!router.is_diverted());

        router.write_record(b"direct\n").unwrap();
        assert_eq!(sink.contents(), "held\ndirect\n");
    }

    #[test]
    fn test_progress_attach_is_shared_by_clones() {
        let router = LogRouter::with_console(Vec::new());
        let clone = router.clone();
        assert!(!clone.has_progress());

        router.attach_progress(ProgressBar::hidden());
        assert!(clone.has_progress());
        // Console writes go around the bar.
        clone.write_record(b"").unwrap();

        clone.detach_progress();
        assert!(!router.has_progress());
    }

    #[test]
    fn test_console_router_keeps_extra_sinks() {
        let sink = MemorySink::new();
        let router = LogRouter::with_console(vec![Box::new(sink.clone())]);
        let (queue, _consumer) = queue::channel().unwrap();

        let sinks = router.divert(queue.producer().unwrap()).unwrap();
        assert_eq!(sinks.len(), 2);
        router.hold();
        router.restore(sinks);

        router.write_record(b"after restore\n").unwrap();
        assert_eq!(sink.contents(), "after restore\n");
    }

    #[test]
    fn test_hold_without_divert_is_noop() {
        let router = LogRouter::new(Vec::new());
        assert!(router.hold().is_none());
        assert!(!router.is_diverted());
    }
}
