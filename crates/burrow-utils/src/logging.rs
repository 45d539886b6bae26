//! # Logging Utilities
//!
//! Logging setup for burrow tools using `tracing`.
//!
//! The core library only emits events; a tool calls one of the `init_*`
//! functions once at startup to decide where they go:
//! - Pretty output for humans or JSON for machines
//! - `RUST_LOG` filtering
//! - An optional log file next to the console output
//!
//! Console output goes to **stderr** so it never mixes with data a tool
//! prints on stdout.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use burrow_utils::init_logging;
//!
//! // keep the guard alive until exit, or buffered file output is lost
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter (e.g. `RUST_LOG=debug`, `RUST_LOG=burrow_core=trace`)
//! - `BURROW_LOG_FORMAT`: `json` or `pretty` (default `pretty`)
//! - `BURROW_LOG_FILE`: optional log file path; `{date}` is replaced by the
//!   current UTC date

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const LOG_FORMAT_VAR: &str = "BURROW_LOG_FORMAT";

/// Environment variable naming an additional log file
pub const LOG_FILE_VAR: &str = "BURROW_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl LogLevel
{
    /// Level for a `-v` count: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    pub fn from_verbosity(count: u8) -> Self
    {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// Keeps buffered file output flowing
///
/// Dropping it flushes and stops the background writer, so hold it until
/// the program exits.
#[derive(Debug)]
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// Reads `BURROW_LOG_FORMAT`, `BURROW_LOG_FILE` and `RUST_LOG` (default
/// filter `warn`).
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - `BURROW_LOG_FORMAT` holds an unknown format
/// - The log file cannot be created
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(LOG_FORMAT_VAR) {
        Ok(value) if !value.is_empty() => LogFormat::from_str(&value).map_err(LoggingError::InvalidFormat)?,
        _ => LogFormat::Pretty,
    };
    init_logging_with_level(None, format)
}

/// Initialize logging with an explicit level and format
///
/// An explicit level wins over `RUST_LOG`; with `None`, `RUST_LOG` is used
/// if set and `warn` otherwise.
///
/// ## Example
///
/// ```rust,no_run
/// use burrow_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// let _guard = init_logging_with_level(Some(LogLevel::Debug), LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: Option<LogLevel>, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let filter = build_filter(level.map(Into::into))?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(format)];
    let mut guard = None;
    if let Some(path) = env::var(LOG_FILE_VAR).ok().filter(|value| !value.is_empty()) {
        let path = expand_date(&path);
        let (layer, worker) = file_layer(&path, format)?;
        layers.push(layer);
        guard = Some(worker);
    }

    Registry::default()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}

fn build_filter(explicit: Option<Level>) -> Result<EnvFilter, LoggingError>
{
    if let Some(level) = explicit {
        return Ok(EnvFilter::new(level.to_string()));
    }
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => {
            EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidLevel(format!("{directives}: {e}")))
        }
        _ => Ok(EnvFilter::new(Level::WARN.to_string())),
    }
}

fn console_layer(format: LogFormat) -> BoxedLayer
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InitializationFailed(format!("{} has no file name", path.display())))?;
    std::fs::create_dir_all(directory)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy().into_owned())
        .build(directory)
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    };
    Ok((layer, guard))
}

/// Replace `{date}` with today's UTC date (`YYYY-MM-DD`).
pub fn expand_date(path: &str) -> PathBuf
{
    if !path.contains("{date}") {
        return PathBuf::from(path);
    }
    let today = Utc::now().format("%Y-%m-%d").to_string();
    PathBuf::from(path.replace("{date}", &today))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level or filter directive
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_verbosity_mapping()
    {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(9), LogLevel::Trace);
        assert_eq!(Level::from(LogLevel::from_verbosity(1)), Level::INFO);
    }

    #[test]
    fn test_date_expansion()
    {
        assert_eq!(expand_date("/tmp/burrow.log"), PathBuf::from("/tmp/burrow.log"));
        let expanded = expand_date("/tmp/{date}-burrow.log");
        let name = expanded.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains("{date}"));
        assert_eq!(name.len(), "YYYY-MM-DD-burrow.log".len());
    }

    #[test]
    fn test_explicit_level_builds_filter()
    {
        assert!(build_filter(Some(Level::DEBUG)).is_ok());
    }
}
