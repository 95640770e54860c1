//! # Logging Utilities
//!
//! Logging setup for trapdoor using `tracing`.
//!
//! - Pretty output for people, JSON output for tooling
//! - Filtering through `RUST_LOG` or an explicit level
//! - An optional daily-rolling log file next to the console output
//!
//! Console output goes to stderr. Stdout belongs to the front end and to the
//! debuggee, which shares the terminal.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trapdoor_utils::init_logging;
//!
//! // Keep the guard alive for as long as the program logs
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Debugger started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=trapdoor_core::machine=trace`)
//! - `TRAPDOOR_LOG_FORMAT`: `pretty` (default) or `json`
//! - `TRAPDOOR_LOG_FILE`: also log to this file, rotated daily

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const FORMAT_ENV: &str = "TRAPDOOR_LOG_FORMAT";
/// Environment variable naming a log file
pub const FILE_ENV: &str = "TRAPDOOR_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable output (default)
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s} (use 'pretty' or 'json')"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
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
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s} (use 'error', 'warn', 'info', 'debug' or 'trace')"
            ))),
        }
    }
}

/// Keeps the log file writer alive
///
/// Dropping it flushes and closes the log file. Console logging keeps
/// working either way.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// `RUST_LOG` sets the filter (default `info`), `TRAPDOOR_LOG_FORMAT` the
/// format and `TRAPDOOR_LOG_FILE` an optional log file.
///
/// ## Errors
///
/// - `TRAPDOOR_LOG_FORMAT` holds an unknown format
/// - a global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(FORMAT_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::default(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    install(format, filter, env::var_os(FILE_ENV).map(PathBuf::from))
}

/// Initialize logging with an explicit level and format
///
/// The level overrides `RUST_LOG`; `TRAPDOOR_LOG_FILE` is still honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use trapdoor_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Json)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let filter = EnvFilter::new(Level::from(level).to_string());
    install(format, filter, env::var_os(FILE_ENV).map(PathBuf::from))
}

fn install(format: LogFormat, filter: EnvFilter, log_file: Option<PathBuf>) -> Result<LoggingGuard, LoggingError>
{
    let mut file_guard = None;
    let file_layer = match log_file {
        Some(path) => {
            let (directory, name) = split_log_path(&path)?;
            let appender = tracing_appender::rolling::daily(directory, name);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            file_guard = Some(worker);

            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false);
            Some(match format {
                LogFormat::Pretty => layer.with_filter(filter.clone()).boxed(),
                LogFormat::Json => layer
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_filter(filter.clone())
                    .boxed(),
            })
        }
        None => None,
    };

    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    let console_layer: BoxedLayer = match format {
        LogFormat::Pretty => console.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => console
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    Ok(LoggingGuard { _file: file_guard })
}

/// Split a log file path into the directory to roll in and the file prefix.
fn split_log_path(path: &Path) -> Result<(PathBuf, OsString), LoggingError>
{
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath(path.to_path_buf()))?
        .to_os_string();
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&directory)?;
    Ok((directory, name))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// The log file path has no file name
    #[error("Invalid log file path: {}", .0.display())]
    InvalidPath(PathBuf),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
