//! Coordinator tests against real worker processes.

use hmull::HmullError;
use hmull::coordinator::{Coordinator, CoordinatorConfig};
use hmull::lock::{find_overlap, read_trace};
use hmull::logging::LogRouter;
use hmull::logging::router::MemorySink;
use hmull::paths::AppPaths;
use hmull::store::Appender;
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};

/// Install SQL on the run's store through a separate connection.
fn alter_store(tmp: &TempDir, sql: &str) {
    let paths = AppPaths::new(tmp.path());
    rusqlite::Connection::open(&paths.store_path)
        .unwrap()
        .execute_batch(sql)
        .unwrap();
}

fn config(tmp: &TempDir, workers: usize) -> CoordinatorConfig {
    let paths = AppPaths::from_root(tmp.path()).unwrap();
    CoordinatorConfig::from_paths(&paths)
        .with_workers(workers)
        .with_worker_exe(PathBuf::from(env!("CARGO_BIN_EXE_hmull")))
}

fn quiet_router() -> LogRouter {
    LogRouter::new(Vec::new())
}

/// Value of `key=<digits>` in a formatted log line.
fn field(line: &str, key: &str) -> Option<u64> {
    let needle = format!("{}=", key);
    let start = line
        .match_indices(&needle)
        .map(|(i, _)| i + needle.len())
        .find(|&i| {
            let before = &line[..i - needle.len()];
            before.is_empty() || !before.ends_with(|c: char| c.is_alphanumeric() || c == '_')
        })?;
    let digits: String = line[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[test]
fn test_hundred_jobs_of_hundred_ops() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let mut coordinator = Coordinator::new(config(&tmp, 4), &router).unwrap();

    let report = coordinator.process(100, 100).unwrap();
    assert_eq!(report.before, 0);
    assert_eq!(report.after, 10_000);
    assert_eq!(report.written, 10_000);
    assert_eq!(coordinator.store().unwrap().count().unwrap(), 10_000);

    // Repeating with no jobs changes nothing.
    let report = coordinator.process(0, 100).unwrap();
    assert_eq!(report.before, 10_000);
    assert_eq!(report.after, 10_000);

    let stats = coordinator.shutdown().unwrap();
    assert_eq!(stats.pool.worker_count, 4);
    assert_eq!(stats.pool.jobs_completed, 100);
}

#[test]
fn test_zero_ops_jobs_still_complete() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let mut coordinator = Coordinator::new(config(&tmp, 2), &router).unwrap();

    let report = coordinator.process(10, 0).unwrap();
    assert_eq!(report.written, 0);
    assert_eq!(report.after, 0);

    let stats = coordinator.shutdown().unwrap();
    assert_eq!(stats.pool.jobs_completed, 10);
}

#[test]
fn test_guarded_sections_never_overlap() {
    let tmp = tempdir().unwrap();
    let trace = tmp.path().join("lock-trace.jsonl");
    let router = quiet_router();
    let config = config(&tmp, 4).with_lock_trace(Some(trace.clone()));
    let mut coordinator = Coordinator::new(config, &router).unwrap();

    coordinator.process(60, 20).unwrap();
    coordinator.shutdown().unwrap();

    let spans = read_trace(&trace).unwrap();
    assert_eq!(spans.len(), 60);
    assert!(spans.iter().all(|s| s.exit_ns >= s.enter_ns));
    if let Some((a, b)) = find_overlap(&spans) {
        panic!("guarded sections overlap: {:?} and {:?}", a, b);
    }
}

#[test]
fn test_outstanding_jobs_bounded_by_batch() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let config = config(&tmp, 3).with_batch_size(200);
    let mut coordinator = Coordinator::new(config, &router).unwrap();

    let report = coordinator.process(450, 1).unwrap();
    assert_eq!(report.after, 450);
    assert!(report.peak_outstanding <= 200, "{}", report.peak_outstanding);
    assert_eq!(report.peak_outstanding, 200);

    let stats = coordinator.shutdown().unwrap();
    assert!(stats.pool.peak_outstanding <= 200);
}

#[test]
fn test_small_batches_still_verify() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let config = config(&tmp, 2).with_batch_size(7);
    let mut coordinator = Coordinator::new(config, &router).unwrap();

    let report = coordinator.process(50, 3).unwrap();
    assert_eq!(report.after, 150);
    assert!(report.peak_outstanding <= 7);
}

#[test]
fn test_worker_log_lines_keep_per_process_order() {
    let tmp = tempdir().unwrap();
    let sink = MemorySink::new();
    let router = LogRouter::new(vec![Box::new(sink.clone())]);
    let mut coordinator = Coordinator::new(config(&tmp, 3), &router).unwrap();

    coordinator.process(90, 1).unwrap();
    let stats = coordinator.shutdown().unwrap();
    assert!(!router.is_diverted());
    assert_eq!(stats.logs.dropped, 0);
    assert_eq!(stats.pool.worker_log_dropped, 0);

    let contents = sink.contents();
    let mut last_seq: HashMap<u64, u64> = HashMap::new();
    let mut committed = 0;
    for line in contents.lines().filter(|l| l.contains("job committed")) {
        let pid = field(line, "pid").unwrap_or_else(|| panic!("no pid in {}", line));
        let seq = field(line, "seq").unwrap_or_else(|| panic!("no seq in {}", line));
        let prev = last_seq.insert(pid, seq).unwrap_or(0);
        assert_eq!(seq, prev + 1, "worker {} logged out of order", pid);
        committed += 1;
    }
    assert_eq!(committed, 90);
    assert!(!last_seq.is_empty() && last_seq.len() <= 3);
}

#[test]
fn test_store_failure_fails_the_run() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let config = config(&tmp, 2).with_batch_size(10);
    let mut coordinator = Coordinator::new(config, &router).unwrap();

    // The store refuses to grow past 25 records; whole jobs roll back.
    alter_store(
        &tmp,
        "CREATE TRIGGER cap_records BEFORE INSERT ON records
         WHEN (SELECT COUNT(*) FROM records) >= 25
         BEGIN SELECT RAISE(ABORT, 'store full'); END;",
    );

    let err = coordinator.process(10, 10).unwrap_err();
    match err {
        HmullError::JobFailed { message, .. } => assert!(message.contains("store full")),
        other => panic!("unexpected error: {:?}", other),
    }

    let count = coordinator.store().unwrap().count().unwrap();
    assert_eq!(count % 10, 0, "a job was partially committed");
    assert!(count <= 30);

    // Resources are still released in order after a failed run.
    coordinator.shutdown().unwrap();
}

#[test]
fn test_unexpected_store_growth_is_an_invariant_violation() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let mut coordinator = Coordinator::new(config(&tmp, 2), &router).unwrap();

    // Every record written by a worker brings a twin along.
    alter_store(
        &tmp,
        "CREATE TRIGGER twin_records AFTER INSERT ON records
         WHEN NEW.uuid NOT LIKE 'twin-%'
         BEGIN
             INSERT INTO records (uuid, pid, created_at)
             VALUES ('twin-' || NEW.uuid, NEW.pid, NEW.created_at);
         END;",
    );

    match coordinator.process(5, 4).unwrap_err() {
        HmullError::InvariantViolation { expected, actual } => {
            assert_eq!(expected, 20);
            assert_eq!(actual, 2 * expected);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(coordinator.store().unwrap().count().unwrap(), 40);

    let stats = coordinator.shutdown().unwrap();
    assert_eq!(stats.pool.jobs_completed, 5);
    assert!(!router.is_diverted());
}

#[test]
fn test_process_after_failed_startup_is_impossible() {
    let tmp = tempdir().unwrap();
    let router = quiet_router();
    let config = config(&tmp, 1).with_worker_exe(PathBuf::from("/nonexistent/hmull"));

    assert!(Coordinator::new(config, &router).is_err());
    assert!(!router.is_diverted());
}

#[test]
fn test_field_parser() {
    let line = "INFO worker{pid=42}: hmull::worker::context: job committed pid=42 seq=7 job_id=3";
    assert_eq!(field(line, "pid"), Some(42));
    assert_eq!(field(line, "seq"), Some(7));
    assert_eq!(field(line, "job_id"), Some(3));
    assert_eq!(field(line, "id"), None);
}
