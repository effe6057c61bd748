//! Error types for hmull.

use thiserror::Error;

/// Main error type for hmull.
#[derive(Error, Debug)]
pub enum HmullError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Shared lock error: {0}")]
    Lock(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Worker {worker_id} died: {reason}")]
    WorkerDied { worker_id: usize, reason: String },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: u64, message: String },

    #[error("Worker already initialized in this process")]
    AlreadyInitialized,

    #[error("Worker used before initialization")]
    NotInitialized,

    #[error(
        "Invariant violated: store grew by {actual} records, expected exactly {expected}. \
         Writes were not serialized or a transaction was torn."
    )]
    InvariantViolation { expected: u64, actual: u64 },

    #[error("Progress overflow: {completed} completed exceeds {submitted} submitted")]
    ProgressOverflow { completed: u64, submitted: u64 },

    #[error("Coordinator has been shut down")]
    ShutDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for hmull operations.
pub type Result<T> = std::result::Result<T, HmullError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_invariant_violation_message() {
        let err = HmullError::InvariantViolation {
            expected: 10_000,
            actual: 9_900,
        };
        let msg = err.to_string();
        assert!(msg.contains("10000"));
        assert!(msg.contains("9900"));
        assert!(msg.contains("Invariant"));
    }

    #[test]
    fn test_job_failed_message() {
        let err = HmullError::JobFailed {
            job_id: 42,
            message: "disk I/O error".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("disk I/O error"));
    }

    #[test]
    fn test_worker_died_message() {
        let err = HmullError::WorkerDied {
            worker_id: 3,
            reason: "killed by signal SIGKILL".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Worker 3"));
        assert!(msg.contains("SIGKILL"));
    }

    #[test]
    fn test_progress_overflow_message() {
        let err = HmullError::ProgressOverflow {
            completed: 11,
            submitted: 10,
        };
        assert_eq!(
            err.to_string(),
            "Progress overflow: 11 completed exceeds 10 submitted"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: HmullError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let err: HmullError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_database_error_conversion() {
        // Opening a directory as a database fails
        let result = rusqlite::Connection::open("/");
        if let Err(db_err) = result {
            let err: HmullError = db_err.into();
            assert!(err.to_string().contains("Database"));
        }
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u64> {
            Ok(42)
        }

        fn returns_err() -> Result<u64> {
            Err(HmullError::NotInitialized)
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
