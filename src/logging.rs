//! Logging initialization.
//!
//! Sets up the tracing subscriber from the logging configuration section,
//! supporting stdout, stderr, and file output in pretty, compact, or JSON
//! format.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initializes the logging system.
///
/// Returns a guard that must be kept alive for the duration of the program so
/// buffered log lines are flushed on exit.
///
/// `level_override` takes precedence over the configured level (it comes from
/// the CLI). With `trace_deps` set, dependency crates log at the same level as
/// the gateway instead of being capped at `warn`.
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override
        .unwrap_or_else(|| config.level.clone())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if trace_deps {
            EnvFilter::new(level)
        } else {
            // Keep the chatty dependency crates down to warnings.
            EnvFilter::new(format!(
                "{},pingora_core=warn,pingora_proxy=warn,hickory_resolver=warn,reqwest=warn,hyper=warn",
                level
            ))
        }
    });

    let (writer, guard) = make_writer(&config.output)?;

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(config.include_target);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(config.include_target);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(config.include_target);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }

    Ok(guard)
}

/// Builds the non-blocking writer for the configured destination.
fn make_writer(output: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    let pair = match output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_appender::non_blocking(file)
        }
    };
    Ok(pair)
}
