//! SQLite record store shared by the coordinator and every worker.
//!
//! Writers go through an [`Appender`], whose write method takes a
//! [`WriteGuard`] so an unserialized write cannot be expressed.
//! [`SerializedAppender`] pairs an appender with the [`SharedMutex`] and is the
//! only write path the workers use.

use crate::error::{HmullError, Result};
use crate::lock::{SharedMutex, WriteGuard};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// How long SQLite retries a locked database before returning SQLITE_BUSY.
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY,
        uuid TEXT NOT NULL UNIQUE,
        pid INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
"#;

/// A unit persisted to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub uuid: Uuid,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Generate a record with a fresh random identifier.
    pub fn generate() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            pid: std::process::id(),
            created_at: Utc::now(),
        }
    }

    /// Generate `count` records.
    pub fn generate_batch(count: u64) -> Vec<Self> {
        (0..count).map(|_| Self::generate()).collect()
    }
}

/// Write capability over the shared store.
pub trait Appender {
    /// Append all `records` atomically and return the new total record count.
    ///
    /// Either every record persists or none do.
    fn append(&mut self, guard: &WriteGuard<'_>, records: &[Record]) -> Result<u64>;

    /// Current total record count (read-only).
    fn count(&self) -> Result<u64>;
}

/// Connection to the SQLite record store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the store at `path`, setting journal mode and schema.
    ///
    /// Only the coordinator calls this, before any worker exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(HmullError::InvalidPath(format!(
                "'{}' is a directory, not a database file",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
        // WAL lets the coordinator count while a worker holds the write lock.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open a store the coordinator already created.
    ///
    /// Never creates the file, changes the journal mode or touches the schema,
    /// so it issues no writes outside a [`WriteGuard`].
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA temp_store = MEMORY;")?;

        let has_records: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'records'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if has_records.is_none() {
            return Err(HmullError::InvalidPath(format!(
                "'{}' has no records table",
                path.display()
            )));
        }
        Ok(Self { conn })
    }

    /// Drop every record and recreate the schema.
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<()> {
        self.conn.execute_batch("DROP TABLE IF EXISTS records;")?;
        self.conn.execute_batch(SCHEMA)?;
        debug!("store reset");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Appender for Store {
    fn append(&mut self, _guard: &WriteGuard<'_>, records: &[Record]) -> Result<u64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO records (uuid, pid, created_at) VALUES (?1, ?2, ?3)",
            )?;
            for record in records {
                stmt.execute(rusqlite::params![
                    record.uuid.to_string(),
                    record.pid,
                    record.created_at.timestamp_micros(),
                ])?;
            }
        }

        let total: i64 = tx.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        // Dropping an uncommitted transaction rolls it back.
        tx.commit()?;
        Ok(total as u64)
    }

    fn count(&self) -> Result<u64> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(total as u64)
    }
}

/// Outcome of one serialized append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records written by this append.
    pub written: u64,
    /// Store total right after the append committed.
    pub total: u64,
}

/// An [`Appender`] whose writes always happen under the [`SharedMutex`].
pub struct SerializedAppender<A> {
    inner: A,
    lock: SharedMutex,
}

impl<A: Appender> SerializedAppender<A> {
    pub fn new(inner: A, lock: SharedMutex) -> Self {
        Self { inner, lock }
    }

    /// Acquire the lock, generate `count` records, append them in one
    /// transaction, then release.
    ///
    /// The lock covers the whole transaction, not only the insert statements.
    pub fn append_generated(&mut self, count: u64) -> Result<AppendOutcome> {
        let guard = self.lock.acquire()?;
        let records = Record::generate_batch(count);
        let total = self.inner.append(&guard, &records)?;
        guard.release()?;
        Ok(AppendOutcome {
            written: records.len() as u64,
            total,
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.inner.count()
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}
