//! Logging infrastructure for jeefhs
//!
//! The agent runs unattended on the edge device, so its log file in
//! `~/.local/state/jeefhs/` is the primary record of outages, retries and
//! storage faults. Interactive runs can mirror the same events to stderr.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_NAME: &str = "jeefhs.log";

/// Where log events go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Rolling file only (service mode)
    File,
    /// Rolling file plus a compact stderr mirror
    FileAndStderr,
    /// Stderr only, for short-lived tools
    Stderr,
}

impl Output {
    fn file(self) -> bool {
        matches!(self, Output::File | Output::FileAndStderr)
    }

    fn stderr(self) -> bool {
        matches!(self, Output::Stderr | Output::FileAndStderr)
    }
}

/// Initialize logging under the XDG state directory.
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init(config: &LoggingConfig, output: Output) -> Result<LoggingGuard> {
    init_in(config, output, &Config::state_dir())
}

/// Initialize logging with log files written to `log_dir`.
pub fn init_in(config: &LoggingConfig, output: Output, log_dir: &Path) -> Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            Error::Config(format!("invalid logging.level '{}': {}", config.level, e))
        })?,
    };

    let (file_layer, guard) = if output.file() {
        std::fs::create_dir_all(log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let stderr_layer = output.stderr().then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        output = ?output,
        version = env!("CARGO_PKG_VERSION"),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (captured by the test harness)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Flushes buffered file output when dropped; hold it for the process lifetime.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

/// Today's log file. The daily appender suffixes the UTC date.
pub fn log_file_path() -> PathBuf {
    let mut name = Config::log_path().into_os_string();
    name.push(format!(".{}", Utc::now().format("%Y-%m-%d")));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let path = log_file_path();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(&format!("{LOG_FILE_NAME}.")));
    }

    #[test]
    fn test_output_targets() {
        assert!(Output::File.file() && !Output::File.stderr());
        assert!(Output::FileAndStderr.file() && Output::FileAndStderr.stderr());
        assert!(!Output::Stderr.file() && Output::Stderr.stderr());
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let log_dir = dir.path().join("state/jeefhs");
        let config = LoggingConfig {
            level: "debug".to_string(),
        };

        let _guard = init_in(&config, Output::File, &log_dir);
        assert!(log_dir.is_dir());
    }
}
