//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its request/response pipes.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::{HmullError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::time::{Duration, Instant};

/// Handle to a worker subprocess with IPC channels.
#[derive(Debug)]
pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    /// Whether the process has been reaped
    reaped: bool,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(stdin),
            reader: LineReader::new(stdout),
            reaped: false,
        }
    }

    /// Create from a spawned `std::process::Child`, taking its stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HmullError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HmullError::Worker("Child stdout not captured".into()))?;

        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a request to the worker.
    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| HmullError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Receive a response from the worker.
    ///
    /// Returns `None` if the worker closed its stdout (EOF).
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        match self.reader.read_line() {
            Ok(Some(line)) => {
                let response = WorkResponse::from_line(line)
                    .map_err(|e| HmullError::Worker(format!("Invalid worker response: {}", e)))?;
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(HmullError::Worker(format!(
                "Failed to receive from worker: {}",
                e
            ))),
        }
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            _ => {
                self.reaped = true;
                false
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(HmullError::Worker("Process already reaped".into()));
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| HmullError::Worker(format!("waitpid failed: {}", e)))?;
        self.reaped = true;
        Ok(status)
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(HmullError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => Err(HmullError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<WaitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| HmullError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| HmullError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Gracefully stop the worker: send exit, wait up to `timeout`, then
    /// escalate to SIGTERM and SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        let _ = self.send(&WorkRequest::Exit);
        if self.wait_timeout(timeout)?.is_some() {
            return Ok(());
        }

        let _ = self.terminate();
        if self.wait_timeout(Duration::from_millis(100))?.is_some() {
            return Ok(());
        }

        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_proc_from_child() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        assert!(proc.is_running());

        // `cat` echoes the exit request back, then exits on SIGTERM
        proc.stop(Duration::from_millis(200)).expect("Failed to stop");
        assert!(!proc.is_running());
    }

    #[test]
    fn test_proc_recv_invalid_response() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        // `cat` echoes the request, which is not a valid response
        proc.send(&WorkRequest::process(1, 1)).unwrap();
        let err = proc.recv().unwrap_err();
        assert!(err.to_string().contains("Invalid worker response"));
    }

    #[test]
    fn test_proc_eof_after_exit() {
        let child = Command::new("true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn true");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        assert!(proc.recv().unwrap().is_none());
        let status = proc.wait().unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn test_proc_terminate() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sleep");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        assert!(proc.is_running());

        proc.terminate().expect("Failed to terminate");
        assert!(proc.wait_timeout(Duration::from_secs(5)).unwrap().is_some());
        assert!(!proc.is_running());
    }
}
