//! Worker subprocess main entry point.
//!
//! Runs when `hmull worker` is invoked by a [`WorkerPool`](super::WorkerPool).
//! Reads requests from stdin and answers on stdout; stderr is the log queue.

use super::context::WorkerContext;
use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::spawn::WorkerConfig;
use crate::error::{HmullError, Result};
use crate::logging::{self, DropCounter};
use std::io::{self, Write};

/// Exit status of a worker that aborted on a fatal error.
pub const EXIT_FATAL: i32 = 70;

/// What the loop does after answering a request.
#[derive(Debug, PartialEq, Eq)]
enum Control {
    Continue,
    Exit,
}

/// What this process has been through so far.
#[derive(Default)]
struct WorkerState {
    /// Set by the first `init`, whether or not it succeeded.
    init_received: bool,
    context: Option<WorkerContext>,
    log_dropped: Option<DropCounter>,
}

impl WorkerState {
    fn init(&mut self, config: &WorkerConfig) -> Result<()> {
        self.log_dropped = logging::init_worker(config)?;
        self.context = Some(WorkerContext::init(config)?);
        Ok(())
    }
}

/// Answer one request.
///
/// `Err` is fatal to the process; everything else is reported to the
/// coordinator as a response.
fn handle_request(
    state: &mut WorkerState,
    request: WorkRequest,
) -> Result<(Option<WorkResponse>, Control)> {
    match request {
        WorkRequest::Init { config } => {
            if std::mem::replace(&mut state.init_received, true) {
                return Err(HmullError::AlreadyInitialized);
            }
            let response = match state.init(&config) {
                Ok(()) => WorkResponse::Ready,
                Err(e) => WorkResponse::error(None, e.to_string()),
            };
            Ok((Some(response), Control::Continue))
        }

        WorkRequest::Process {
            job_id,
            item_count,
        } => {
            let response = match state.context.as_mut() {
                None => WorkResponse::error(Some(job_id), HmullError::NotInitialized.to_string()),
                Some(ctx) => match ctx.process(job_id, item_count) {
                    Ok(outcome) => {
                        let dropped = state.log_dropped.as_ref().map_or(0, DropCounter::get);
                        WorkResponse::done(job_id, outcome.written, outcome.total, dropped)
                    }
                    Err(e) => {
                        tracing::error!(job_id, error = %e, "job failed");
                        WorkResponse::error(Some(job_id), e.to_string())
                    }
                },
            };
            Ok((Some(response), Control::Continue))
        }

        WorkRequest::Exit => Ok((None, Control::Exit)),
    }
}

/// Worker main loop.
///
/// Returns `Ok` on an orderly exit (an `exit` request or EOF on stdin).
fn worker_loop(reader: &mut LineReader, writer: &mut LineWriter) -> Result<()> {
    let mut state = WorkerState::default();

    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            // EOF - parent closed the pipe
            None => return Ok(()),
        };

        let request = match WorkRequest::from_line(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = WorkResponse::error(None, format!("Invalid request: {}", e));
                writer.write_line(&resp.to_line()?)?;
                continue;
            }
        };

        let (response, control) = handle_request(&mut state, request)?;
        if let Some(response) = response {
            writer.write_line(&response.to_line()?)?;
        }
        if control == Control::Exit {
            if let Some(ctx) = &state.context {
                tracing::debug!(jobs = ctx.jobs_processed(), "worker exiting");
            }
            return Ok(());
        }
    }
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 on an orderly shutdown and [`EXIT_FATAL`] otherwise.
pub fn run_worker_main() -> ! {
    // Ignore SIGPIPE - a vanished coordinator surfaces as an io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let channels = PipeFd::dup_of(io::stdin()).and_then(|stdin| {
        let stdout = PipeFd::dup_of(io::stdout())?;
        Ok((stdin, stdout))
    });
    let (stdin_fd, stdout_fd) = match channels {
        Ok(fds) => fds,
        Err(e) => {
            let _ = writeln!(io::stderr(), "hmull worker: cannot open IPC channels: {}", e);
            std::process::exit(EXIT_FATAL);
        }
    };

    let mut reader = LineReader::new(stdin_fd);
    let mut writer = LineWriter::new(stdout_fd);

    match worker_loop(&mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "worker aborting");
            // stderr is the non-blocking log queue; never panic on a full pipe.
            let _ = writeln!(
                io::stderr(),
                "hmull worker {}: fatal: {}",
                std::process::id(),
                e
            );
            std::process::exit(EXIT_FATAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SharedMutex;
    use crate::store::Store;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            store_path: dir.join("demo.db"),
            lock_path: dir.join("store.lock"),
            log_fd: None,
            log_path: dir.to_path_buf(),
            log_filter: "info".into(),
            work_delay_ms: 0,
            lock_trace_path: None,
        }
    }

    /// State of a worker whose `init` succeeded, without installing a
    /// process-wide subscriber.
    fn initialized(config: &WorkerConfig) -> WorkerState {
        Store::open(&config.store_path).unwrap();
        SharedMutex::create(&config.lock_path).unwrap();
        WorkerState {
            init_received: true,
            context: Some(WorkerContext::init(config).unwrap()),
            log_dropped: None,
        }
    }

    #[test]
    fn test_process_before_init_is_reported() {
        let mut state = WorkerState::default();
        let (response, control) =
            handle_request(&mut state, WorkRequest::process(3, 10)).unwrap();

        assert_eq!(control, Control::Continue);
        match response {
            Some(WorkResponse::Error { job_id, message }) => {
                assert_eq!(job_id, Some(3));
                assert!(message.contains("before initialization"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_exit_stops_loop_silently() {
        let mut state = WorkerState::default();
        let (response, control) = handle_request(&mut state, WorkRequest::Exit).unwrap();
        assert!(response.is_none());
        assert_eq!(control, Control::Exit);
    }

    #[test]
    fn test_second_init_is_fatal() {
        let tmp = tempdir().unwrap();
        let config = config_in(tmp.path());

        let mut state = initialized(&config);
        let err = handle_request(&mut state, WorkRequest::Init { config }).unwrap_err();
        assert!(matches!(err, HmullError::AlreadyInitialized));
    }

    #[test]
    fn test_second_init_after_failed_first_is_fatal() {
        let tmp = tempdir().unwrap();
        // Neither the store nor the lock exists, so the first init fails.
        let config = config_in(tmp.path());
        let mut state = WorkerState::default();

        let (response, control) = handle_request(
            &mut state,
            WorkRequest::Init {
                config: config.clone(),
            },
        )
        .unwrap();
        assert!(matches!(response, Some(WorkResponse::Error { job_id: None, .. })));
        assert_eq!(control, Control::Continue);
        assert!(state.context.is_none());

        let err = handle_request(&mut state, WorkRequest::Init { config }).unwrap_err();
        assert!(matches!(err, HmullError::AlreadyInitialized));
    }

    #[test]
    fn test_process_after_init_reports_done() {
        let tmp = tempdir().unwrap();
        let config = config_in(tmp.path());

        let mut state = initialized(&config);
        let (response, _) = handle_request(&mut state, WorkRequest::process(1, 4)).unwrap();
        assert_eq!(response, Some(WorkResponse::done(1, 4, 4, 0)));
    }
}
