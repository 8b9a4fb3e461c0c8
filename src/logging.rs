use std::io;
use std::path::Path;

use time::UtcOffset;
use time::macros::format_description;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{self, fmt, prelude::*};

/// Initialize the tracing subscriber.
///
/// Logs go to stderr (stdout carries the tool protocol and must stay clean),
/// optionally tee'd into a non-blocking file sink. The returned guard must be
/// held for the process lifetime so buffered file output is flushed.
pub fn init_logger(
    no_color: bool,
    log_level: Option<&str>,
    log_file: Option<&Path>,
) -> io::Result<Option<WorkerGuard>> {
    let timer = fmt::time::OffsetTime::new(
        UtcOffset::UTC,
        format_description!(
            "[[[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z]"
        ),
    );

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(timer.clone())
        .with_ansi(!no_color);

    // --log-level wins over RUST_LOG; default is "info"
    let env_filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_timer(timer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(()) => Ok(guard),
        Err(e) => {
            // A subscriber may already be installed (tests re-enter here)
            if e.to_string().contains("already been set") {
                Ok(guard)
            } else {
                Err(io::Error::other(e))
            }
        }
    }
}
