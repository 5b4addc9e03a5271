// src/dispatch/job.rs

//! One group running on one worker.
//!
//! Each busy worker is driven by its own task running [`run_job`]. The task
//! forwards everything the worker says to the dispatcher loop and enforces the
//! per-test deadline and the interrupt; it never touches scheduling state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exec::{WorkerCommand, WorkerConnection, WorkerEvent, WorkerLauncher};
use crate::protocol::{HostMessage, RunGroup, TestPayload, WorkerInit, WorkerMessage};
use crate::suite::TestCase;
use crate::types::{ProjectName, TestError, TestId, TestStatus};

/// Everything the dispatcher loop learns, in the order it happened.
#[derive(Debug)]
pub(crate) enum DispatchEvent {
    Message {
        worker_index: usize,
        message: WorkerMessage,
    },
    JobFinished(JobReport),
    /// A busy worker was stopped by its job (timeout or interrupt).
    WorkerStopped {
        worker_index: usize,
        teardown_errors: Vec<TestError>,
    },
    /// An idle worker handed to [`retire_worker`] has exited.
    WorkerRetired {
        worker_index: usize,
        teardown_errors: Vec<TestError>,
    },
}

/// One live worker, owned by the dispatcher while idle and by a job task
/// while busy.
#[derive(Debug)]
pub struct WorkerHandle {
    pub worker_index: usize,
    pub pid: Option<u32>,
    pub project: ProjectName,
    pub hash: String,
    /// Tests that did not pass on this worker.
    pub failures: u32,
    pub crashed: bool,
    conn: WorkerConnection,
}

impl WorkerHandle {
    pub(crate) fn new(
        worker_index: usize,
        project: ProjectName,
        hash: String,
        conn: WorkerConnection,
    ) -> Self {
        Self {
            worker_index,
            pid: conn.pid,
            project,
            hash,
            failures: 0,
            crashed: false,
            conn,
        }
    }

    fn send(&self, message: HostMessage) -> bool {
        self.conn.commands.send(WorkerCommand::Send(message)).is_ok()
    }

    fn kill(&self) {
        let _ = self.conn.commands.send(WorkerCommand::Kill);
    }

    /// Ask the worker to stop and wait until its transport closes, killing it
    /// once `grace` has elapsed. Messages other than `stopped` go to
    /// `on_message`; the teardown errors from `stopped` are returned.
    pub(crate) async fn shutdown(
        &mut self,
        grace: Duration,
        mut on_message: impl FnMut(WorkerMessage),
    ) -> Vec<TestError> {
        let worker_index = self.worker_index;
        let mut teardown_errors = Vec::new();
        if !self.send(HostMessage::Stop) {
            self.kill();
        }

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        let mut killed = false;

        loop {
            tokio::select! {
                event = self.conn.events.recv() => match event {
                    Some(WorkerEvent::Message(WorkerMessage::Stopped { teardown_errors: errors })) => {
                        teardown_errors.extend(errors);
                    }
                    Some(WorkerEvent::Message(message)) => on_message(message),
                    Some(WorkerEvent::Exited { code }) => {
                        debug!(worker_index, ?code, "worker exited after stop");
                        break;
                    }
                    None => break,
                },
                _ = &mut deadline, if !killed => {
                    warn!(worker_index, grace_ms = grace.as_millis() as u64, "worker did not stop in time; killing it");
                    self.kill();
                    killed = true;
                }
            }
        }

        teardown_errors
    }
}

/// Where the job's worker comes from.
pub(crate) enum WorkerSlot {
    Reuse(WorkerHandle),
    Launch(WorkerInit),
}

pub(crate) struct JobSpec {
    pub job_id: u64,
    pub project: ProjectName,
    pub hash: String,
    /// Tests in execution order with the attempt index each one runs as.
    pub tests: Vec<(Arc<TestCase>, u32)>,
}

#[derive(Clone)]
pub(crate) struct JobEnv {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub events: mpsc::UnboundedSender<DispatchEvent>,
    pub interrupt: CancellationToken,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobEnd {
    Completed,
    TimedOut,
    Interrupted,
    Crashed {
        running: Option<TestId>,
        exit_code: Option<i32>,
    },
    LaunchFailed(String),
}

#[derive(Debug)]
pub(crate) struct JobReport {
    pub job_id: u64,
    pub worker_index: usize,
    pub project: ProjectName,
    pub hash: String,
    /// Handed back only when the group completed normally.
    pub worker: Option<WorkerHandle>,
    /// Tests the worker never began, in group order.
    pub unstarted: Vec<TestId>,
    pub end: JobEnd,
}

pub(crate) async fn run_job(spec: JobSpec, slot: WorkerSlot, env: JobEnv) {
    let report = drive(spec, slot, &env).await;
    debug!(job_id = report.job_id, end = ?report.end, "job finished");
    let _ = env.events.send(DispatchEvent::JobFinished(report));
}

async fn drive(spec: JobSpec, slot: WorkerSlot, env: &JobEnv) -> JobReport {
    let mut unstarted: Vec<TestId> = spec.tests.iter().map(|(t, _)| t.id.clone()).collect();
    let timeouts: HashMap<TestId, Option<Duration>> = spec
        .tests
        .iter()
        .map(|(t, _)| (t.id.clone(), t.timeout))
        .collect();

    let report = |worker_index: usize,
                  worker: Option<WorkerHandle>,
                  unstarted: Vec<TestId>,
                  end: JobEnd| JobReport {
        job_id: spec.job_id,
        worker_index,
        project: spec.project.clone(),
        hash: spec.hash.clone(),
        worker,
        unstarted,
        end,
    };

    let mut worker = match slot {
        WorkerSlot::Reuse(worker) => worker,
        WorkerSlot::Launch(init) => {
            let worker_index = init.worker_index;
            match env.launcher.launch(worker_index).await {
                Ok(conn) => {
                    let worker = WorkerHandle::new(
                        worker_index,
                        init.project.clone(),
                        init.worker_hash.clone(),
                        conn,
                    );
                    info!(worker_index, pid = ?worker.pid, project = %worker.project, "worker launched");
                    worker.send(HostMessage::Init(init));
                    worker
                }
                Err(err) => {
                    error!(worker_index, error = %err, "failed to launch worker");
                    return report(worker_index, None, unstarted, JobEnd::LaunchFailed(err.to_string()));
                }
            }
        }
    };
    let worker_index = worker.worker_index;

    let payload = RunGroup {
        job_id: spec.job_id,
        tests: spec
            .tests
            .iter()
            .map(|(test, attempt)| TestPayload {
                test_id: test.id.clone(),
                title: test.title.clone(),
                cmd: test.cmd.clone(),
                attempt: *attempt,
                fixtures: test.fixtures.clone(),
                skip: test.skip,
            })
            .collect(),
    };
    debug!(worker_index, job_id = spec.job_id, tests = payload.tests.len(), "sending group");
    // A closed command channel shows up as `Exited` below.
    worker.send(HostMessage::Run(payload));

    let forward = |message: WorkerMessage| {
        let _ = env.events.send(DispatchEvent::Message {
            worker_index,
            message,
        });
    };

    let mut running: Option<(TestId, Duration)> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            event = worker.conn.events.recv() => match event {
                Some(WorkerEvent::Message(message)) => {
                    match &message {
                        WorkerMessage::TestBegin { test_id, .. } => {
                            unstarted.retain(|id| id != test_id);
                            let timeout = timeouts.get(test_id).copied().flatten();
                            deadline = timeout.map(|t| Instant::now() + t);
                            running = Some((test_id.clone(), timeout.unwrap_or_default()));
                        }
                        WorkerMessage::TestEnd { test_id, status, .. } => {
                            if running.as_ref().is_some_and(|(id, _)| id == test_id) {
                                running = None;
                                deadline = None;
                            }
                            if !matches!(status, TestStatus::Passed | TestStatus::Skipped) {
                                worker.failures += 1;
                            }
                        }
                        WorkerMessage::GroupDone { .. } => {
                            return report(worker_index, Some(worker), unstarted, JobEnd::Completed);
                        }
                        _ => {}
                    }
                    forward(message);
                }
                Some(WorkerEvent::Exited { code }) => {
                    worker.crashed = true;
                    let running = running.map(|(id, _)| id);
                    warn!(worker_index, ?code, ?running, "worker exited unexpectedly");
                    return report(worker_index, None, unstarted, JobEnd::Crashed { running, exit_code: code });
                }
                None => {
                    worker.crashed = true;
                    let running = running.map(|(id, _)| id);
                    return report(worker_index, None, unstarted, JobEnd::Crashed { running, exit_code: None });
                }
            },

            _ = timer => {
                if let Some((test_id, timeout)) = running.take() {
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(worker_index, test_id = %test_id, timeout_ms, "test timed out");
                    forward(WorkerMessage::TestEnd {
                        test_id,
                        status: TestStatus::TimedOut,
                        duration_ms: timeout_ms,
                        error: Some(TestError::new(format!("Test timeout of {timeout_ms}ms exceeded."))),
                    });
                }
                // The abandoned test may still report; only its output is kept.
                let teardown_errors = worker
                    .shutdown(env.stop_grace, |message| {
                        if matches!(
                            message,
                            WorkerMessage::Stdout { .. }
                                | WorkerMessage::Stderr { .. }
                                | WorkerMessage::FatalError { .. }
                        ) {
                            forward(message);
                        }
                    })
                    .await;
                let _ = env.events.send(DispatchEvent::WorkerStopped { worker_index, teardown_errors });
                return report(worker_index, None, unstarted, JobEnd::TimedOut);
            },

            _ = env.interrupt.cancelled() => {
                info!(worker_index, "interrupt received; stopping busy worker");
                let mut ended = false;
                let current = running.as_ref().map(|(id, _)| id.clone());
                let teardown_errors = worker
                    .shutdown(env.stop_grace, |message| {
                        let message = match message {
                            WorkerMessage::TestEnd { test_id, status, duration_ms, error }
                                if current.as_ref() == Some(&test_id) =>
                            {
                                ended = true;
                                interrupted_end(test_id, status, duration_ms, error)
                            }
                            WorkerMessage::TestBegin { .. } | WorkerMessage::TestEnd { .. } => return,
                            other => other,
                        };
                        forward(message);
                    })
                    .await;
                if let (Some(test_id), false) = (current, ended) {
                    forward(interrupted_end(test_id, TestStatus::Interrupted, 0, None));
                }
                let _ = env.events.send(DispatchEvent::WorkerStopped { worker_index, teardown_errors });
                return report(worker_index, None, unstarted, JobEnd::Interrupted);
            }
        }
    }
}

/// The end of a test that was running when the interrupt fired. Whatever
/// killed it, a test that did not pass counts as interrupted.
fn interrupted_end(
    test_id: TestId,
    status: TestStatus,
    duration_ms: u64,
    error: Option<TestError>,
) -> WorkerMessage {
    let (status, error) = match status {
        TestStatus::Passed | TestStatus::Skipped => (status, error),
        _ => (
            TestStatus::Interrupted,
            Some(TestError::new("Test was interrupted")),
        ),
    };
    WorkerMessage::TestEnd {
        test_id,
        status,
        duration_ms,
        error,
    }
}

/// Stop an idle worker that will not be reused.
pub(crate) async fn retire_worker(mut worker: WorkerHandle, env: JobEnv) {
    let worker_index = worker.worker_index;
    debug!(worker_index, "retiring worker");
    let teardown_errors = worker
        .shutdown(env.stop_grace, |message| {
            let _ = env.events.send(DispatchEvent::Message {
                worker_index,
                message,
            });
        })
        .await;
    let _ = env.events.send(DispatchEvent::WorkerRetired {
        worker_index,
        teardown_errors,
    });
}
