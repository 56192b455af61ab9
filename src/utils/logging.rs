//! Structured logging setup.
//!
//! Components log through `tracing` macros; each proxy session runs inside a
//! `proxy_session` span carrying its client id. [`init_logging`] installs the
//! process-wide subscriber exactly once, fixing the enabled severities for the
//! lifetime of the process.

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Log severities, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Unrecoverable conditions; emitted at tracing's `ERROR` level
    Fatal,
}

impl Severity {
    pub fn as_level(self) -> Level {
        match self {
            Severity::Trace => Level::TRACE,
            Severity::Debug => Level::DEBUG,
            Severity::Info => Level::INFO,
            Severity::Warn => Level::WARN,
            Severity::Error | Severity::Fatal => Level::ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Severity::Trace),
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            other => Err(format!("Invalid log level: {other}")),
        }
    }
}

impl From<Severity> for LevelFilter {
    fn from(severity: Severity) -> Self {
        LevelFilter::from_level(severity.as_level())
    }
}

static INSTALLED: OnceCell<Severity> = OnceCell::new();

/// Install the global subscriber described by `config`.
///
/// Only the first call installs anything; later calls return the severity
/// that is already in effect. `RUST_LOG`, when set, refines the filter.
pub fn init_logging(config: &LoggingConfig) -> Result<Severity> {
    INSTALLED
        .get_or_try_init(|| {
            let writer = make_writer(config)?;
            let filter = EnvFilter::builder()
                .with_default_directive(LevelFilter::from(config.log_level).into())
                .from_env_lossy();

            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(config.log_to_console && !config.log_to_file)
                .with_target(true);

            let installed = if config.json_format {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.map_err(|e| {
                ProtocolError::ConfigError(format!("Failed to install log subscriber: {e}"))
            })?;

            tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
            Ok(config.log_level)
        })
        .copied()
}

fn make_writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    if !config.log_to_console && !config.log_to_file {
        return Err(ProtocolError::ConfigError(
            "At least one logging output (console or file) must be enabled".into(),
        ));
    }
    if !config.log_to_file {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    }

    let path = config.log_file_path.as_deref().ok_or_else(|| {
        ProtocolError::ConfigError("log_file_path must be specified when log_to_file is true".into())
    })?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}")))?;

    // File output wins over the console when both are enabled
    Ok(BoxMakeWriter::new(Mutex::new(file)))
}
