// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ConfigFile;
use crate::errors::{Result, TestherdError};

/// Command-line arguments for `testherd`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "testherd",
    version,
    about = "Run test suites across a pool of worker processes, project by project.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TESTHERD_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the tests.
    Run(RunArgs),

    /// Load and print the tests without running them.
    List(SelectArgs),

    /// Serve the worker side of the IPC protocol on stdin/stdout.
    #[command(hide = true)]
    Worker,
}

/// Which configuration and which projects.
#[derive(Debug, Clone, Args)]
pub struct SelectArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "testherd.toml")]
    pub config: PathBuf,

    /// Only run this project (and what it depends on). Repeatable.
    #[arg(long = "project", value_name = "NAME")]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Maximum number of concurrent workers.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Retries for failing tests, overriding every project.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Per-test timeout, overriding every project; `0` disables it.
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Budget for the whole run; `0` disables it.
    #[arg(long, value_name = "MS")]
    pub global_timeout_ms: Option<u64>,

    /// Do not fail when no tests are found.
    #[arg(long)]
    pub pass_with_no_tests: bool,
}

impl RunArgs {
    /// Apply the command-line overrides on top of the loaded file.
    pub fn apply(&self, mut config: ConfigFile) -> Result<ConfigFile> {
        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(TestherdError::ConfigError(
                    "--workers must be at least 1".to_string(),
                ));
            }
            config.config.workers = workers;
        }
        if let Some(retries) = self.retries {
            config.config.retries = retries;
            for project in config.project.iter_mut() {
                project.retries = None;
            }
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.config.timeout_ms = timeout_ms;
            for project in config.project.iter_mut() {
                project.timeout_ms = None;
            }
        }
        if let Some(global_timeout_ms) = self.global_timeout_ms {
            config.config.global_timeout_ms = global_timeout_ms;
        }
        if self.pass_with_no_tests {
            config.config.pass_with_no_tests = true;
        }
        Ok(config)
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
