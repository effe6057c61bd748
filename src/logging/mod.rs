//! Logging for the coordinator and its worker processes.
//!
//! The coordinator installs one global subscriber whose writer is a
//! [`LogRouter`]. While a run is active the router forwards into the
//! process-shared [`queue`], the same queue every worker writes to, and a
//! single [`LogAggregator`] thread writes everything to the real sinks.
//!
//! # Environment Variables
//!
//! - `HMULL_LOG` - Log filter (overrides RUST_LOG)
//! - `HMULL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `HMULL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `HMULL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `HMULL_LOG_ROTATION` - Log file rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use hmull::logging::{LogConfig, init};
//!
//! let router = init(LogConfig::default().with_env_overrides()).unwrap();
//! ```

pub mod aggregator;
pub mod queue;
pub mod router;

pub use aggregator::{AggregatorStats, LogAggregator};
pub use queue::{DropCounter, LogConsumer, LogProducer, LogQueue};
pub use router::{ConsoleSink, LogRouter, LogSink};

use crate::error::{HmullError, Result};
use crate::worker::spawn::WorkerConfig;
use std::io::IsTerminal;
use std::os::unix::io::BorrowedFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable records (default)
    #[default]
    Pretty,
    /// One line per record
    Compact,
    /// One JSON object per record
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the coordinator's log file starts a new file.
///
/// Rotated files are named `<file>.<date>`; `Never` writes `<file>` itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Coordinator logging configuration.
///
/// Built from CLI flags, then [`with_env_overrides`](Self::with_env_overrides),
/// then passed to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Log file written next to stderr (None = stderr only)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Filter directive; takes precedence over `level`
    pub filter: Option<String>,
    /// Colorize stderr output (default: stderr is a terminal)
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            file_path: None,
            rotation: LogRotation::default(),
            filter: None,
            ansi: std::io::stderr().is_terminal(),
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply `HMULL_LOG*` / `RUST_LOG` overrides.
    ///
    /// A filter already set from the command line (`-v`, `-q`) is kept, and
    /// so is the level it implies. Format, file and rotation variables always
    /// apply when they parse.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("HMULL_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Some(level) = env_parsed("HMULL_LOG_LEVEL", parse_level)
        {
            self.level = level;
        }
        if let Some(format) = env_parsed("HMULL_LOG_FORMAT", |s| s.parse().ok()) {
            self.format = format;
        }
        if let Some(rotation) = env_parsed("HMULL_LOG_ROTATION", |s| s.parse().ok()) {
            self.rotation = rotation;
        }
        if let Ok(path) = std::env::var("HMULL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    /// The filter directive in effect, as handed to worker processes.
    pub fn filter_directive(&self) -> String {
        match &self.filter {
            Some(filter) if EnvFilter::try_new(filter).is_ok() => filter.clone(),
            _ => self.level.to_string().to_lowercase(),
        }
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter
            && EnvFilter::try_new(filter).is_err()
        {
            eprintln!("Warning: Invalid log filter '{}', using default", filter);
        }
        EnvFilter::new(self.filter_directive())
    }
}

fn env_parsed<T>(var: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    std::env::var(var).ok().and_then(|value| parse(&value))
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// File appender for `path`, rotated per `rotation`.
fn file_appender(path: &Path, rotation: LogRotation) -> Result<RollingFileAppender> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("hmull.log");

    RollingFileAppender::builder()
        .rotation(rotation.into())
        .filename_prefix(file_name)
        .build(parent)
        .map_err(|e| {
            HmullError::Logging(format!(
                "Failed to open log file '{}': {}",
                path.display(),
                e
            ))
        })
}

/// File sinks for `config`; the console sink is added by the router.
fn file_sinks(config: &LogConfig) -> Result<Vec<LogSink>> {
    match &config.file_path {
        Some(path) => Ok(vec![Box::new(file_appender(path, config.rotation)?)]),
        None => Ok(Vec::new()),
    }
}

/// Initialize the global tracing subscriber.
///
/// Every record goes through the returned [`LogRouter`], which writes to
/// stderr and the configured log file. Call once at program startup; a second
/// call leaves the first subscriber in place.
pub fn init(config: LogConfig) -> Result<LogRouter> {
    let router = LogRouter::with_console(file_sinks(&config)?);
    // One writer feeds both stderr and the file; keep escape codes out of files.
    let ansi = config.ansi && config.file_path.is_none();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer().json().with_writer(router.clone()).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(router.clone())
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_ansi(ansi)
            .with_writer(router.clone())
            .boxed(),
    };

    // Already initialized: keep the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(config.build_filter())
        .try_init();
    Ok(router)
}

/// Install a worker process's subscriber.
///
/// Compact single-line records without colors, written to the inherited log
/// queue, or to `log_path/worker-<pid>.log` when no queue is configured.
/// Returns the queue producer's drop count, if records go to the queue.
pub fn init_worker(config: &WorkerConfig) -> Result<Option<DropCounter>> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string().to_lowercase()));

    let (writer, dropped) = match config.log_fd {
        Some(raw) => {
            // SAFETY: the fd is only borrowed long enough to duplicate it; a
            // descriptor that is not open makes the duplication fail.
            let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
            let fd = borrowed.try_clone_to_owned().map_err(|e| {
                HmullError::Logging(format!("Log queue fd {} is not usable: {}", raw, e))
            })?;
            let producer = LogProducer::new(fd);
            let dropped = producer.drop_counter();
            (BoxMakeWriter::new(producer), Some(dropped))
        }
        None => {
            let path = config
                .log_path
                .join(format!("worker-{}.log", std::process::id()));
            (
                BoxMakeWriter::new(file_appender(&path, LogRotation::Never)?),
                None,
            )
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_ansi(false).with_writer(writer))
        .with(filter)
        .try_init()
        .map_err(|e| HmullError::Logging(format!("Failed to install worker subscriber: {}", e)))?;
    Ok(dropped)
}
