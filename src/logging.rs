//! Tracing subscriber setup
//!
//! Human-readable output always goes to stderr (stdout carries JSON results
//! of CLI commands). When file logging is enabled, a JSON layer writes to a
//! rolling file through a non-blocking writer; the returned guard must live
//! until the program exits so buffered lines are flushed.
//!
//! Filter precedence: `RUST_LOG` > configured level > "info".

use crate::config::{LogRotation, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the default filter directive from a configured level
///
/// A bare level ("debug") is scoped to this crate with dependencies at warn;
/// anything containing a directive separator is used as-is.
pub fn default_directive(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("rollstat={},warn", level)
    }
}

/// Install the global subscriber
///
/// Returns the file writer guard when file logging is active.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if !config.file_enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.file_dir) {
        eprintln!(
            "Warning: Could not create log directory {:?}: {}",
            config.file_dir, e
        );
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let file_appender = match config.file_rotation {
        LogRotation::Hourly => {
            tracing_appender::rolling::hourly(&config.file_dir, &config.file_prefix)
        }
        LogRotation::Daily => {
            tracing_appender::rolling::daily(&config.file_dir, &config.file_prefix)
        }
        LogRotation::Never => {
            tracing_appender::rolling::never(&config.file_dir, &config.file_prefix)
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // File layer uses JSON for structured log parsing
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    Some(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_level_is_scoped_to_crate() {
        assert_eq!(default_directive("debug"), "rollstat=debug,warn");
    }

    #[test]
    fn test_directives_pass_through() {
        assert_eq!(default_directive("rollstat=trace"), "rollstat=trace");
        assert_eq!(default_directive("info,r2d2=off"), "info,r2d2=off");
    }
}
