//! Path layout for a run directory.
//!
//! ```text
//! <root>/
//!   demo.db        shared record store
//!   store.lock     cross-process write lock
//!   logs/
//!     hmull.log    aggregated coordinator + worker log
//! ```

use crate::error::{HmullError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default store filename.
pub const STORE_FILENAME: &str = "demo.db";

/// Lock file guarding the store's write path.
pub const LOCK_FILENAME: &str = "store.lock";

/// Log directory under the root.
pub const LOG_DIRNAME: &str = "logs";

/// Aggregated log filename.
pub const LOG_FILENAME: &str = "hmull.log";

/// Resolved paths for one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub root: PathBuf,
    pub store_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_dir: PathBuf,
}

impl AppPaths {
    /// Derive the layout under `root` without touching the filesystem.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            store_path: root.join(STORE_FILENAME),
            lock_path: root.join(LOCK_FILENAME),
            log_dir: root.join(LOG_DIRNAME),
            root,
        }
    }

    /// Derive the layout and create `root/` and `root/logs/`.
    pub fn from_root<P: AsRef<Path>>(root: P) -> Result<Self> {
        let paths = Self::new(root);
        if paths.root.exists() && !paths.root.is_dir() {
            return Err(HmullError::InvalidPath(format!(
                "'{}' exists and is not a directory",
                paths.root.display()
            )));
        }
        fs::create_dir_all(&paths.log_dir)?;
        Ok(paths)
    }

    /// Path of the aggregated log file.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(LOG_FILENAME)
    }
}
