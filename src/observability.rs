//! Observability and structured logging infrastructure.
//!
//! Production-grade logging on the tracing framework: structured key-value
//! fields, span tracking across async boundaries, environment filtering,
//! and optional JSON/file output.
//!
//! # Environment Configuration
//!
//! ```bash
//! # Set log level for all modules
//! RUST_LOG=debug realm-ledger serve
//!
//! # Component-specific levels
//! RUST_LOG=realm_ledger=debug,sqlx=warn realm-ledger serve
//!
//! # JSON output for log aggregation
//! LOG_JSON=true realm-ledger serve
//!
//! # Write logs to a file with daily rotation
//! LOG_FILE=./logs/ledger.log realm-ledger serve
//! ```

use std::path::{Path, PathBuf};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{LedgerError, LedgerResult};

/// Initialize the tracing subscriber with configurable output formats.
///
/// # Arguments
///
/// * `log_level` - Level override; falls back to `RUST_LOG`, then "info"
/// * `log_file` - Optional file path enabling daily log rotation
/// * `json_output` - JSON format suitable for aggregation when true
///
/// # Errors
///
/// Returns a configuration error when the log file's directory cannot be
/// resolved or the subscriber is already set.
pub fn init_tracing(
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    json_output: bool,
) -> LedgerResult<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("realm_ledger=info,warn")),
    };

    let console_layer = if json_output {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let file_layer = match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| {
                    LedgerError::config(format!("LOG_FILE has no file name: {}", path.display()), None)
                })?
                .to_os_string();

            let appender = tracing_appender::rolling::daily(directory, file_name);
            Some(fmt::layer().with_ansi(false).with_writer(appender).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            LedgerError::config("Failed to initialize tracing subscriber", Some(Box::new(e)))
        })?;

    Ok(())
}

/// Read the logging configuration from the environment.
#[must_use]
pub fn logging_from_env() -> (Option<String>, Option<PathBuf>, bool) {
    let level = std::env::var("LOG_LEVEL").ok();
    let file = std::env::var("LOG_FILE").ok().map(PathBuf::from);
    let json = std::env::var("LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    (level, file, json)
}
