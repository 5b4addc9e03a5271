// src/lib.rs

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod dispatch;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod reporter;
pub mod results;
pub mod suite;
pub mod tasks;
pub mod types;
pub mod worker;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigFile;
use crate::dag::{Phase, build_phases};
use crate::errors::Result;
use crate::exec::WorkerLauncher;
use crate::fs::RealFileSystem;
use crate::plugin::Plugin;
use crate::reporter::{FullResult, InternalReporter, Reporter};
use crate::results::TestRecord;
use crate::suite::{SuiteLoader, TomlSuiteLoader};
use crate::tasks::builtin::{list_pipeline, run_pipeline};
use crate::tasks::{RunContext, RunLimits, TaskRunReport, TaskRunner, TaskRunnerStatus};
use crate::types::{RunStatus, TestError};

/// What an invocation produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// One record per loaded test, in suite order.
    pub tests: Vec<TestRecord>,
}

/// Collaborators of one invocation.
pub struct RunOptions {
    pub reporter: Arc<dyn Reporter>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub loader: Arc<dyn SuiteLoader>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    /// Cancelled on Ctrl-C.
    pub interrupt: CancellationToken,
}

impl RunOptions {
    /// Options loading TOML test files from disk.
    pub fn new(reporter: Arc<dyn Reporter>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            reporter,
            launcher,
            loader: Arc::new(TomlSuiteLoader::new(Arc::new(RealFileSystem))),
            plugins: Vec::new(),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn SuiteLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_interrupt(mut self, interrupt: CancellationToken) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// Load, schedule and run every test of `config`.
///
/// Fails only for problems found before anything runs (a dependency cycle);
/// everything later is folded into the returned status.
pub async fn run_all_tests(config: ConfigFile, options: RunOptions) -> Result<RunOutcome> {
    let phase_order = build_phases(&config.project)?;
    let runner = run_pipeline(&options.plugins);
    execute(config, options, runner, phase_order, Mode::Run).await
}

/// Load the suite and report it without starting any worker.
pub async fn list_all_tests(config: ConfigFile, options: RunOptions) -> Result<RunOutcome> {
    let phase_order = build_phases(&config.project)?;
    let runner = list_pipeline(&options.plugins);
    execute(config, options, runner, phase_order, Mode::List).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    List,
}

async fn execute(
    config: ConfigFile,
    options: RunOptions,
    runner: TaskRunner<RunContext>,
    phase_order: Vec<Phase>,
    mode: Mode,
) -> Result<RunOutcome> {
    let started = Instant::now();
    let limits = RunLimits {
        global_timeout: config.config.global_timeout(),
        interrupt: options.interrupt.clone(),
        interrupt_grace: config.config.stop_grace() * 2,
    };

    let reporter = Arc::new(InternalReporter::new(options.reporter, config.clone()));
    let mut ctx = RunContext::new(
        config,
        Arc::clone(&reporter),
        options.loader,
        options.launcher,
        options.interrupt,
    );
    ctx.plugins = options.plugins;
    ctx.phase_order = phase_order;

    let report = runner.run(&mut ctx, limits).await;
    report_pipeline_errors(reporter.as_ref(), &report);
    flush_unattributed_errors(reporter.as_ref(), &ctx.fatal_errors);

    let tests = ctx.test_records();
    let status = final_status(&report, &ctx, &tests, mode);
    info!(?status, tests = tests.len(), "invocation finished");

    reporter.on_end(&FullResult {
        status,
        duration: started.elapsed(),
    });
    Ok(RunOutcome { status, tests })
}

fn report_pipeline_errors(reporter: &dyn Reporter, report: &TaskRunReport) {
    if let Some(failure) = &report.failure {
        reporter.on_error(&TestError::new(format!("{:#}", failure.error)));
    }
    for failure in report.teardown_failures.iter() {
        reporter.on_error(&TestError::new(format!(
            "Error in '{}' teardown: {:#}",
            failure.task, failure.error
        )));
    }
    if report.status == TaskRunnerStatus::TimedOut {
        reporter.on_error(&TestError::new("Timed out waiting for the test run to finish"));
    }
}

/// Report everything no single test owns as one error.
fn flush_unattributed_errors(reporter: &dyn Reporter, errors: &[TestError]) {
    if errors.is_empty() {
        return;
    }
    warn!(count = errors.len(), "errors outside of tests");
    let message = if errors.len() == 1 {
        "1 error was not a part of any test".to_string()
    } else {
        format!("{} errors were not a part of any test", errors.len())
    };
    let details = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    reporter.on_error(&TestError::new(message).with_details(details));
}

fn final_status(report: &TaskRunReport, ctx: &RunContext, tests: &[TestRecord], mode: Mode) -> RunStatus {
    match report.status {
        TaskRunnerStatus::TimedOut => return RunStatus::TimedOut,
        TaskRunnerStatus::Interrupted => return RunStatus::Interrupted,
        TaskRunnerStatus::Completed | TaskRunnerStatus::Failed => {}
    }

    let failed = report.failure.is_some()
        || !report.teardown_failures.is_empty()
        || !ctx.load_errors.is_empty()
        || !ctx.fatal_errors.is_empty()
        || ctx.worker_errors
        || (mode == Mode::Run && tests.iter().any(|t| !t.outcome().is_ok()));

    if failed {
        RunStatus::Failed
    } else {
        RunStatus::Passed
    }
}
