//! Tracing setup for binaries embedding the core.
//!
//! `RUST_LOG` overrides the default `info` filter.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable terminal output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing(format: LogFormat) -> bool {
    init_tracing_with_filter(format, "info")
}

/// Install the global subscriber with a fallback filter used when `RUST_LOG`
/// is unset or invalid.
pub fn init_tracing_with_filter(format: LogFormat, default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
    result.is_ok()
}
