//! # Logging Utilities
//!
//! `tracing` subscriber setup for hosts embedding the loader.
//!
//! The loader core only emits events: one `load_program{program=...}` span
//! per program, `warn!` for every relocation that fell back to a best-effort
//! default, `info!` for map creation. This module decides where they go.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrobpf_utils::init_logging;
//!
//! // Reads RUST_LOG, FERROBPF_LOG_FORMAT and FERROBPF_LOG_FILE
//! init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Loader started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=ferrobpf_core=trace`)
//! - `FERROBPF_LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `FERROBPF_LOG_FILE`: optional file receiving a copy of the console output
//!
//! ## Examples
//!
//! ```rust,no_run
//! use ferrobpf_utils::{LogFormat, LogLevel, init_file_logging, init_logging_with_level};
//!
//! // Console, explicit level
//! init_logging_with_level(LogLevel::Debug, LogFormat::Pretty).expect("Failed to initialize logging");
//!
//! // Or: file only, for hosts that own stdout
//! let path = init_file_logging("/var/log/ferrobpf", Some(LogLevel::Info)).expect("Failed to initialize logging");
//! println!("logging to {}", path.display());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Once, OnceLock};
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "FERROBPF_LOG_FORMAT";
/// Environment variable naming an extra log file.
pub const LOG_FILE_ENV: &str = "FERROBPF_LOG_FILE";

/// Keeps the non-blocking file writer flushing for the life of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Human-readable, one event per line
    Pretty,
    /// One JSON object per event, with the current span list
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default
    Info,
    Debug,
    /// Every patched instruction and map reference
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
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Initialize console logging from the environment.
///
/// An unparsable `FERROBPF_LOG_FORMAT` falls back to pretty output.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed or the file
/// named by `FERROBPF_LOG_FILE` cannot be opened.
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Pretty);
    install(format, None)
}

/// Initialize console logging with an explicit level and format.
///
/// `RUST_LOG` still overrides the level when set.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed or file
/// logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    install(format, Some(level.into()))
}

/// Initialize file-only logging in `dir`.
///
/// Events go to `dir/YYYY-MM-DD-ferrobpf.log`. Nothing is written to stdout,
/// so hosts that render their own terminal output are left alone.
///
/// ## Errors
///
/// Returns an error if `dir` cannot be created or a global subscriber is
/// already installed.
pub fn init_file_logging(dir: impl AsRef<Path>, level: Option<LogLevel>) -> Result<PathBuf, LoggingError>
{
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let log_file = dir.join(dated_file_name());

    let filter = filter(level.map(Into::into));
    let layer = file_layer(&log_file, LogFormat::Pretty, filter, false)?;
    Registry::default()
        .with(layer)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(log_file)
}

/// Route events to the test harness's captured output.
///
/// Safe to call from every test: only the first call installs anything.
pub fn init_test_logging()
{
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Another harness may already own the global subscriber.
        let _ = fmt::Subscriber::builder()
            .with_env_filter(filter(Some(Level::DEBUG)))
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}

fn dated_file_name() -> String
{
    format!("{}-ferrobpf.log", Utc::now().format("%Y-%m-%d"))
}

/// `RUST_LOG` wins; otherwise `level`, otherwise INFO.
fn filter(level: Option<Level>) -> EnvFilter
{
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.unwrap_or(Level::INFO).to_string()))
}

fn install(format: LogFormat, level: Option<Level>) -> Result<(), LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![console_layer(format, filter(level))];
    if let Some(path) = env::var(LOG_FILE_ENV).ok().map(PathBuf::from) {
        layers.push(file_layer(&path, format, filter(level), true)?);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    formatted(format, io::stdout, true, filter)
}

/// Non-blocking file layer. `daily` rolls the file; otherwise the name is
/// used as given.
fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter, daily: bool) -> Result<BoxedLayer, LoggingError>
{
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::FileError(io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name")))?;
    let appender = if daily {
        tracing_appender::rolling::daily(dir, name)
    } else {
        tracing_appender::rolling::never(dir, name)
    };

    let (writer, guard) = tracing_appender::non_blocking(appender);
    FILE_GUARD
        .set(guard)
        .map_err(|_| LoggingError::InitializationFailed("file logging is already initialized".to_string()))?;
    Ok(formatted(format, writer, false, filter))
}

fn formatted<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
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
        assert_eq!(LogFormat::from_str("dev").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(_))));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(matches!(LogLevel::from_str("loud"), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_dated_file_name()
    {
        let name = dated_file_name();
        assert!(name.ends_with("-ferrobpf.log"));
        assert_eq!(name.len(), "YYYY-MM-DD-ferrobpf.log".len());
    }

    #[test]
    fn test_init_test_logging_is_idempotent()
    {
        init_test_logging();
        init_test_logging();
        tracing::debug!("still fine");
    }
}
