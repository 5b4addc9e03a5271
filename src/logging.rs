// src/logging.rs

//! `tracing` setup for the host and for worker processes.
//!
//! The filter comes from `--log-level` when given, otherwise from the
//! `TESTHERD_LOG` environment variable, which takes full `EnvFilter`
//! directives (`debug`, `testherd::dispatch=trace,info`). Without either,
//! `info` is used. Workers inherit the variable from the host.
//!
//! Everything goes to stderr: the host's stdout belongs to the reporter and a
//! worker's stdout carries the IPC protocol.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "TESTHERD_LOG";

/// Which side of the IPC protocol this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    Host,
    /// Plain lines without timestamps; the host re-logs them with its own.
    Worker,
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, role: LogRole) -> Result<()> {
    let env = std::env::var(LOG_ENV_VAR).ok();
    let filter = build_filter(cli_level, env.as_deref());
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let installed = match role {
        LogRole::Host => builder.with_target(true).try_init(),
        LogRole::Worker => builder
            .with_ansi(false)
            .with_target(false)
            .without_time()
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(directive(level));
    }
    env.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_level_wins_over_the_environment() {
        let filter = build_filter(Some(LogLevel::Debug), Some("warn"));
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn environment_accepts_per_module_directives() {
        let filter = build_filter(None, Some(" testherd::dispatch=trace "));
        assert_eq!(filter.to_string(), "testherd::dispatch=trace");
    }

    #[test]
    fn blank_environment_means_info() {
        assert_eq!(build_filter(None, Some("  ")).to_string(), "info");
        assert_eq!(build_filter(None, None).to_string(), "info");
    }
}
