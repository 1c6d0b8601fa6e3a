//! Forwarding of library log output to a host-provided sink.
//!
//! The library emits `tracing` events, which also surface as `log` records.
//! Hosts that do not run a `tracing` subscriber can install a [`Logger`] with
//! [`set_logger`] to receive them.

use std::sync::{Arc, OnceLock};

/// A sink for log messages.
///
/// # Examples
///
/// ```rust
/// use appgroup_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("[{level:?}] {message}");
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Records `message` at `level`.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Very detailed tracing output.
    Trace,
    /// Debugging information.
    Debug,
    /// Normal operation, e.g. an app was written or a login succeeded.
    Info,
    /// Something failed but the backend keeps serving.
    Warn,
    /// A failure that needs attention.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

/// `log::Log` implementation forwarding to the installed [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        accepts(metadata.level(), metadata.target())
    }

    fn log(&self, record: &log::Record) {
        let module = record.module_path().unwrap_or_else(|| record.target());
        if !accepts(record.level(), module) {
            return;
        }
        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(record.level().into(), record.args().to_string());
        }
    }

    fn flush(&self) {}
}

/// Debug and trace output is only forwarded from this crate's modules.
fn accepts(level: log::Level, module: &str) -> bool {
    level <= log::Level::Info || module.starts_with("appgroup")
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs the process-wide logger. Only the first call has an effect.
///
/// # Errors
///
/// Returns an error if a logger was already installed, by this function or
/// by another `log` implementation.
pub fn set_logger(logger: Arc<dyn Logger>) -> Result<(), log::SetLoggerError> {
    static LOGGER: ForeignLogger = ForeignLogger;
    // The sink is stored first so no record is dropped once `log` routes here.
    let _ = LOGGER_INSTANCE.set(logger);
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
