// src/telemetry.rs
//
// Logging bootstrap. `RUST_LOG` wins over the configured level.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level used when `RUST_LOG` is unset and debug mode is off.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Output format for the subscriber. Config files spell it the same way
/// as the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}', expected json or pretty")),
        }
    }
}

impl TryFrom<String> for LogFormat {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.trim().parse()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    /// `debug` raises the default level; `RUST_LOG` still overrides it.
    pub fn new(debug: bool, format: LogFormat) -> Self {
        Self {
            level: if debug { "debug" } else { DEFAULT_LOG_LEVEL }.to_string(),
            format,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(false, LogFormat::default())
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(build_env_filter(&config.level))
            .with(fmt::layer().json().with_target(false).with_thread_ids(false))
            .try_init()
            .map_err(|err| anyhow!("failed to install tracing subscriber: {err}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(build_env_filter(&config.level))
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .try_init()
            .map_err(|err| anyhow!("failed to install tracing subscriber: {err}")),
    }
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
