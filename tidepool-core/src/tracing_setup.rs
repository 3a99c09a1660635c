//! Tracing setup for Tidepool
//!
//! Console logs at a user-chosen level and, when a logs directory is given, a
//! full trace of the run written to disk.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run trace file inside the logs directory.
pub const LOG_FILE_NAME: &str = "tidepool-last-run.log";

/// Initialize tracing with console output and an optional trace file.
///
/// # Arguments
/// * `console_level` - Log level for console output, overridden by `RUST_LOG`
/// * `logs_dir` - Directory for `tidepool-last-run.log`; no file is written when `None`
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the logs directory cannot be created or
///   the log file cannot be opened for writing
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let log_file_path = match logs_dir {
        Some(dir) => {
            create_dir_all(dir)?;
            Some(dir.join(LOG_FILE_NAME))
        }
        None => None,
    };
    let file_layer = match &log_file_path {
        Some(path) => Some(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(File::create(path)?)
                .with_filter(EnvFilter::new("trace")),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &log_file_path {
        Some(path) => tracing::info!(
            "Tracing initialized: console={}, trace_file={}",
            console_level,
            path.display()
        ),
        None => tracing::info!("Tracing initialized: console={}", console_level),
    }

    Ok(())
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// Maps user-friendly CLI log level names to the corresponding tracing::Level
    /// values for configuring log output verbosity.
    ///
    /// # Examples
    /// ```
    /// use tidepool_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        use clap::ValueEnum;

        assert!(matches!(
            CliLogLevel::from_str("WARN", true),
            Ok(CliLogLevel::Warn)
        ));
        assert!(CliLogLevel::from_str("loud", true).is_err());
        assert_eq!(
            CliLogLevel::Debug.to_possible_value().unwrap().get_name(),
            "debug"
        );
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
    }
}
