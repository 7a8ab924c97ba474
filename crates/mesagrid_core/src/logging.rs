//! Structured logging setup with console and file output.
//!
//! Provides:
//! - Daily rotating log files under `<data_dir>/logs`
//! - Build-type conditional log levels
//! - Console-only fallback when file logging fails
//! - Environment variable override via MESAGRID_LOG or RUST_LOG
//!
//! Passwords and bound parameter values are never passed to tracing macros;
//! SQL appears only as a truncated preview.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Environment variable with the highest-priority filter after an explicit one.
pub const LOG_ENV: &str = "MESAGRID_LOG";

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether stdout is a terminal (stdout-only logging)
    pub is_pty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a new logging configuration.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_pty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Guard that must be held for the lifetime of the process.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Initialize logging with the given configuration.
///
/// If file logging initialization fails, falls back to console-only. Calling
/// this twice keeps the first subscriber.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_pty {
        return init_stdout_logging(config.log_filter.as_deref());
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {e}. Using console only.");
            init_stdout_logging(config.log_filter.as_deref())
        }
    }
}

/// Initialize with the default data directory.
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::new(log_dir()))
}

fn init_stdout_logging(filter: Option<&str>) -> LoggingGuard {
    let env_filter = build_env_filter(filter);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();

    LoggingGuard { _worker_guard: None }
}

fn init_file_logging(config: &LogConfig) -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("mesagrid")
        .filename_suffix("log")
        .build(&config.log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout = std::io::stdout.with_max_level(tracing::Level::INFO);
    let combined = stdout.and(non_blocking);

    let env_filter = build_env_filter(config.log_filter.as_deref());

    tracing_subscriber::fmt()
        .with_writer(combined)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()?;

    Ok(guard)
}

/// Priority: custom filter > MESAGRID_LOG > RUST_LOG > default.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "debug,mesagrid_core=trace,tokio_postgres=warn,mysql_async=warn,rustls=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,mesagrid_core=info,tokio_postgres=warn,mysql_async=warn,rustls=warn"
    }
}

/// Get the default log directory.
pub fn log_dir() -> PathBuf {
    crate::config::default_data_dir().join("logs")
}
