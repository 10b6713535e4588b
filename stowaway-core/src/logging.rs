//! Logging setup for stowaway
//!
//! The dispatch pipeline only emits `tracing` events. Hosts that embed the
//! library install their own subscriber; the CLI calls [`init`] under
//! `--verbose`, which writes daily-rotated files named
//! `stowaway.log.<date>` into `$XDG_STATE_HOME/stowaway/`.
//!
//! A bare level in `[logging] level` applies to the stowaway crates only;
//! everything else, including reqwest and hyper, logs at `warn`. `RUST_LOG`,
//! when set, replaces the configured filter entirely.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// File name prefix of the rotated log files
pub const LOG_FILE_PREFIX: &str = "stowaway.log";

/// Log to the XDG state directory
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(config, Config::state_dir())
}

/// Log to `log_dir`, creating it if needed
pub fn init_in(config: &LoggingConfig, log_dir: impl Into<PathBuf>) -> Result<LoggingGuard> {
    let log_dir = log_dir.into();
    let (writer, guard) = tracing_appender::non_blocking(file_appender(&log_dir, config.max_files)?);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter(&config.level))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        log_dir,
        _guard: guard,
    })
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer alive; dropping it flushes pending lines
pub struct LoggingGuard {
    log_dir: PathBuf,
    _guard: WorkerGuard,
}

impl LoggingGuard {
    /// Directory the log files are written to
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Expand a bare level into per-crate directives; full directives pass through
fn default_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains(['=', ',']) {
        return level.to_string();
    }
    format!("warn,stowaway_core={0},stowaway={0}", level)
}

fn file_appender(log_dir: &Path, max_files: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))
}
