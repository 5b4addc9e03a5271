// src/tasks/builtin.rs

//! The steps an invocation is built from.
//!
//! A run is: plugin setup (one step per plugin), global setup, load, report
//! begin, create phases, run tests. A listing stops after report begin.

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::{PhaseRun, RunCoordinator};
use crate::dispatch::{Dispatcher, DispatcherSettings};
use crate::plugin::Plugin;
use crate::protocol::WorkerMessage;
use crate::reporter::Reporter;
use crate::suite::create_test_groups;
use crate::types::TestError;
use crate::worker::command::{CommandContext, run_shell};

use super::context::RunContext;
use super::runner::{BoxFuture, Task, TaskRunner, Teardown};

type StepResult = anyhow::Result<Option<Box<dyn Teardown<RunContext>>>>;

/// Steps for a full run.
pub fn run_pipeline(plugins: &[Arc<dyn Plugin>]) -> TaskRunner<RunContext> {
    let mut runner = prologue(plugins, true);
    runner.add_task("create phases", CreatePhases);
    runner.add_task("run tests", RunTests);
    runner
}

/// Steps for listing tests without running them.
pub fn list_pipeline(plugins: &[Arc<dyn Plugin>]) -> TaskRunner<RunContext> {
    prologue(plugins, false)
}

fn prologue(plugins: &[Arc<dyn Plugin>], require_tests: bool) -> TaskRunner<RunContext> {
    let mut runner = TaskRunner::new();
    for plugin in plugins {
        runner.add_task(
            format!("plugin setup: {}", plugin.name()),
            PluginSetup {
                plugin: Arc::clone(plugin),
            },
        );
    }
    runner.add_task("global setup", GlobalSetup);
    runner.add_task("load tests", LoadTests { require_tests });
    runner.add_task("report begin", ReportBegin);
    runner
}

pub struct PluginSetup {
    pub plugin: Arc<dyn Plugin>,
}

struct PluginTeardown {
    plugin: Arc<dyn Plugin>,
}

impl Task<RunContext> for PluginSetup {
    fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            self.plugin
                .setup(&ctx.config)
                .await
                .with_context(|| format!("plugin '{}' setup failed", self.plugin.name()))?;
            Ok(Some(Box::new(PluginTeardown {
                plugin: Arc::clone(&self.plugin),
            }) as Box<dyn Teardown<RunContext>>))
        })
    }
}

impl Teardown<RunContext> for PluginTeardown {
    fn teardown<'a>(self: Box<Self>, _ctx: &'a mut RunContext) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.plugin
                .teardown()
                .await
                .with_context(|| format!("plugin '{}' teardown failed", self.plugin.name()))
        })
    }
}

pub struct GlobalSetup;

struct GlobalTeardown {
    cmd: String,
}

impl Task<RunContext> for GlobalSetup {
    fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            if let Some(cmd) = ctx.config.config.global_setup.as_deref() {
                info!(cmd, "running global setup");
                run_host_command("Global setup", cmd, ctx.reporter.as_ref()).await?;
            }
            Ok(ctx.config.config.global_teardown.clone().map(|cmd| {
                Box::new(GlobalTeardown { cmd }) as Box<dyn Teardown<RunContext>>
            }))
        })
    }
}

impl Teardown<RunContext> for GlobalTeardown {
    fn teardown<'a>(self: Box<Self>, ctx: &'a mut RunContext) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!(cmd = %self.cmd, "running global teardown");
            run_host_command("Global teardown", &self.cmd, ctx.reporter.as_ref()).await
        })
    }
}

/// Run a shell command on the host, forwarding its output to the reporter.
async fn run_host_command(what: &str, cmd: &str, reporter: &dyn Reporter) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let run = async move {
        let ctx = CommandContext {
            test_id: None,
            env: &[],
        };
        run_shell(cmd, ctx, &tx).await
    };
    let forward = async {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Stdout { chunk, .. } => reporter.on_std_out(&chunk, None),
                WorkerMessage::Stderr { chunk, .. } => reporter.on_std_err(&chunk, None),
                _ => {}
            }
        }
    };
    let (outcome, ()) = tokio::join!(run, forward);
    if let Some(error) = outcome?.error(what) {
        bail!("{error}");
    }
    Ok(())
}

pub struct LoadTests {
    /// Fail the step on an empty suite unless `pass_with_no_tests` is set.
    pub require_tests: bool,
}

impl Task<RunContext> for LoadTests {
    fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let loaded = ctx.loader.load_all_tests(&ctx.config);
            for error in loaded.errors.iter() {
                warn!(file = %error.file.display(), message = %error.message, "load error");
                ctx.reporter.on_error(&TestError::new(format!(
                    "Error loading {}: {}",
                    error.file.display(),
                    error.message
                )));
            }
            info!(
                tests = loaded.suite.test_count(),
                errors = loaded.errors.len(),
                "tests loaded"
            );
            ctx.suite = loaded.suite;
            ctx.load_errors = loaded.errors;

            if self.require_tests
                && ctx.suite.test_count() == 0
                && !ctx.config.config.pass_with_no_tests
            {
                bail!("No tests found");
            }
            Ok(None)
        })
    }
}

pub struct ReportBegin;

impl Task<RunContext> for ReportBegin {
    fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            for plugin in ctx.plugins.iter() {
                plugin
                    .begin(&ctx.suite)
                    .await
                    .with_context(|| format!("plugin '{}' begin failed", plugin.name()))?;
            }
            ctx.reporter.on_begin(&ctx.config, &ctx.suite);
            Ok(None)
        })
    }
}

pub struct CreatePhases;

/// Stops every dispatcher and collects what they could not attribute.
///
/// Registered by [`CreatePhases`] rather than [`RunTests`] so it also runs
/// when the run step is abandoned on a global timeout or an interrupt.
struct StopDispatchers;

impl Task<RunContext> for CreatePhases {
    fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let settings = DispatcherSettings::from_config(&ctx.config);
            let reporter: Arc<dyn Reporter> = ctx.reporter.clone();

            let mut runs = Vec::with_capacity(ctx.phase_order.len());
            for phase in ctx.phase_order.iter() {
                let mut groups = Vec::new();
                for name in phase.projects.iter() {
                    let (Some(project), Some(project_suite)) =
                        (ctx.config.project(name), ctx.suite.project(name))
                    else {
                        continue;
                    };
                    let limit = project.effective_workers(&ctx.config.config);
                    groups.extend(create_test_groups(&ctx.config, project_suite, limit));
                }
                debug!(phase = phase.index, groups = groups.len(), "phase prepared");

                runs.push(PhaseRun {
                    phase: phase.clone(),
                    groups,
                    dispatcher: Dispatcher::new(
                        settings.clone(),
                        Arc::clone(&ctx.launcher),
                        Arc::clone(&reporter),
                        ctx.dispatch_token.clone(),
                    ),
                });
            }
            ctx.phases = runs;
            Ok(Some(Box::new(StopDispatchers) as Box<dyn Teardown<RunContext>>))
        })
    }
}

impl Teardown<RunContext> for StopDispatchers {
    fn teardown<'a>(self: Box<Self>, ctx: &'a mut RunContext) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.dispatch_token.cancel();
            for run in ctx.phases.iter_mut() {
                run.dispatcher.stop().await;
                ctx.worker_errors |= run.dispatcher.has_worker_errors();
                ctx.fatal_errors.extend(run.dispatcher.take_fatal_errors());
            }
            Ok(())
        })
    }
}

pub struct RunTests;

impl Task<RunContext> for RunTests {
    fn run<'a>(&'a self, ctx: &'a mut RunContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let coordinator = RunCoordinator::new(&ctx.config, &ctx.suite, ctx.reporter.clone());
            let state = coordinator.run(&mut ctx.phases, &mut ctx.skipped).await;
            ctx.coordinator = Some(state);
            Ok(None)
        })
    }
}
