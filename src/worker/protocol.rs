//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited.

use super::spawn::WorkerConfig;
use serde::{Deserialize, Serialize};

/// Request from coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Per-process initialization. Valid exactly once per worker process.
    #[serde(rename = "init")]
    Init { config: WorkerConfig },

    /// Write `item_count` records.
    #[serde(rename = "process")]
    Process { job_id: u64, item_count: u64 },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker finished initialization and is idle.
    #[serde(rename = "ready")]
    Ready,

    /// Job committed.
    #[serde(rename = "done")]
    Done {
        job_id: u64,
        /// Records written by this job
        written: u64,
        /// Store total right after the commit
        total: u64,
        pid: u32,
        /// Log records this worker has dropped so far
        #[serde(default)]
        log_dropped: u64,
    },

    /// Job or request failed; the worker stays usable.
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<u64>,
        message: String,
    },
}

impl WorkRequest {
    pub fn process(job_id: u64, item_count: u64) -> Self {
        Self::Process {
            job_id,
            item_count,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn done(job_id: u64, written: u64, total: u64, log_dropped: u64) -> Self {
        Self::Done {
            job_id,
            written,
            total,
            pid: std::process::id(),
            log_dropped,
        }
    }

    pub fn error(job_id: Option<u64>, message: impl Into<String>) -> Self {
        Self::Error {
            job_id,
            message: message.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
