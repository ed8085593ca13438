//! Logging infrastructure for video2commons workers.
//!
//! This module provides:
//! - Process-wide `tracing` setup (stderr, optional JSON, optional rolling file)
//! - Per-task log files with compact progress filtering
//! - A tail buffer of external tool output for failure diagnosis
//!
//! # Example
//!
//! ```no_run
//! use v2c_core::logging::{LogConfig, TaskLogger};
//!
//! let logger = TaskLogger::new("0b0e7c9c", "/srv/v2c/logs", LogConfig::default()).unwrap();
//! logger.phase("download");
//! logger.command("yt-dlp -f bestvideo+bestaudio/best ...");
//! logger.status("Downloading...", Some(40));
//! logger.success("Uploaded Example.webm");
//! ```

mod task_logger;
mod types;

pub use task_logger::TaskLogger;
pub use types::{LogConfig, LogLevel, MessagePrefix};

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize the global tracing subscriber.
///
/// - Respects `RUST_LOG`, falling back to the configured level
/// - Writes to stderr, as JSON lines when `json` is set
/// - Adds a daily rolling file in `logs_folder` when `rolling_file` is set
///
/// Keep the returned guard alive for the lifetime of the process, otherwise
/// buffered file output is lost.
pub fn init_tracing(settings: &LoggingSettings, logs_folder: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_filter_str()));

    let (file_layer, guard) = match logs_folder.filter(|_| settings.rolling_file) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "v2c-worker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let json_layer = settings
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let plain_layer = (!settings.json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_writer(std::io::stderr)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init();

    guard
}

/// Initialize tracing for tests (only logs warnings and above).
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
