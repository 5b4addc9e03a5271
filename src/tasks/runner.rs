// src/tasks/runner.rs

//! Ordered named steps with a rollback stack.
//!
//! Steps run one after another. A step may hand back a [`Teardown`], which is
//! pushed on a stack; once the pipeline stops, for whatever reason, the stack
//! is unwound last-in first-out. A failing teardown is logged and recorded but
//! does not keep the remaining ones from running.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a step leaves behind to be undone later.
pub trait Teardown<C>: Send {
    fn teardown<'a>(self: Box<Self>, ctx: &'a mut C) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// One pipeline step.
pub trait Task<C>: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a mut C) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn Teardown<C>>>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunnerStatus {
    Completed,
    Failed,
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub error: anyhow::Error,
}

/// How a pipeline run went. Teardowns have always run by the time this is
/// returned.
#[derive(Debug)]
pub struct TaskRunReport {
    pub status: TaskRunnerStatus,
    /// The step that failed, if any.
    pub failure: Option<TaskFailure>,
    pub teardown_failures: Vec<TaskFailure>,
    /// Names of the steps whose teardowns ran, in the order they ran.
    pub rolled_back: Vec<String>,
}

/// Options for [`TaskRunner::run`].
#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    /// Budget measured from the start of the pipeline.
    pub global_timeout: Option<Duration>,
    /// External interrupt (Ctrl-C).
    pub interrupt: CancellationToken,
    /// Time a step gets to finish on its own after the interrupt fires.
    pub interrupt_grace: Duration,
}

enum StepEnd<C> {
    Done(anyhow::Result<Option<Box<dyn Teardown<C>>>>),
    TimedOut,
    Interrupted,
}

pub struct TaskRunner<C> {
    tasks: Vec<(String, Box<dyn Task<C>>)>,
}

impl<C> Default for TaskRunner<C> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<C: Send + 'static> TaskRunner<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, name: impl Into<String>, task: impl Task<C> + 'static) {
        self.tasks.push((name.into(), Box::new(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn run(&self, ctx: &mut C, limits: RunLimits) -> TaskRunReport {
        let deadline = limits.global_timeout.map(|t| Instant::now() + t);
        let mut stack: Vec<(String, Box<dyn Teardown<C>>)> = Vec::new();
        let mut status = TaskRunnerStatus::Completed;
        let mut failure = None;

        for (name, task) in self.tasks.iter() {
            if limits.interrupt.is_cancelled() {
                info!(task = %name, "interrupted before step");
                status = TaskRunnerStatus::Interrupted;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                status = TaskRunnerStatus::TimedOut;
                break;
            }

            debug!(task = %name, "running step");
            let end = {
                let step = task.run(ctx);
                tokio::pin!(step);
                let timer = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                let interrupt = async {
                    limits.interrupt.cancelled().await;
                    tokio::time::sleep(limits.interrupt_grace).await;
                };
                tokio::select! {
                    biased;
                    result = &mut step => StepEnd::Done(result),
                    _ = timer => StepEnd::TimedOut,
                    _ = interrupt => StepEnd::Interrupted,
                }
            };

            match end {
                StepEnd::Done(Ok(teardown)) => {
                    if let Some(teardown) = teardown {
                        stack.push((name.clone(), teardown));
                    }
                    if limits.interrupt.is_cancelled() {
                        info!(task = %name, "interrupted during step");
                        status = TaskRunnerStatus::Interrupted;
                        break;
                    }
                }
                StepEnd::Done(Err(err)) => {
                    error!(task = %name, error = %format!("{err:#}"), "step failed");
                    status = TaskRunnerStatus::Failed;
                    failure = Some(TaskFailure {
                        task: name.clone(),
                        error: err,
                    });
                    break;
                }
                StepEnd::TimedOut => {
                    warn!(task = %name, "global timeout reached; abandoning step");
                    status = TaskRunnerStatus::TimedOut;
                    break;
                }
                StepEnd::Interrupted => {
                    warn!(task = %name, "step did not finish after interrupt; abandoning it");
                    status = TaskRunnerStatus::Interrupted;
                    break;
                }
            }
        }

        let mut teardown_failures = Vec::new();
        let mut rolled_back = Vec::new();
        while let Some((name, teardown)) = stack.pop() {
            debug!(task = %name, "rolling back step");
            if let Err(err) = teardown.teardown(ctx).await {
                error!(task = %name, error = %format!("{err:#}"), "teardown failed");
                teardown_failures.push(TaskFailure {
                    task: name.clone(),
                    error: err,
                });
            }
            rolled_back.push(name);
        }

        info!(?status, "pipeline finished");
        TaskRunReport {
            status,
            failure,
            teardown_failures,
            rolled_back,
        }
    }
}
