//! Tracing subscriber setup for the daemon and CLI.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::domain::models::config::LoggingConfig;

/// Guard keeping the non-blocking file writer alive for the process
/// lifetime. Dropping it flushes buffered log lines.
pub struct LoggingGuard {
    _appender: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global tracing subscriber from configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let guard = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.format == "json" {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.format == "json" {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
            None
        }
    };

    Ok(LoggingGuard { _appender: guard })
}
