// src/worker/mod.rs

//! Worker side of the IPC protocol.
//!
//! A worker is driven entirely by [`HostMessage`]s read from `reader` and
//! answers with [`WorkerMessage`]s written to `writer`, one JSON object per
//! line. The same loop runs in a `testherd worker` child process (over stdio)
//! and in-process (over a duplex pipe).
//!
//! - [`command`] runs one shell command and streams its output.
//! - [`fixtures`] tracks worker-scoped fixtures for teardown on stop.

pub mod command;
pub mod fixtures;

use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{
    FixtureSpec, HostMessage, RunGroup, TestPayload, WorkerInit, WorkerMessage, decode_line,
    encode_line,
};
use crate::types::{TestError, TestStatus};

use command::{CommandContext, run_shell};
use fixtures::WorkerFixtures;

/// Serve the worker protocol until `Stop` arrives or the input closes.
pub async fn run_worker<R, W>(reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

    let writer_task = tokio::spawn(write_messages(writer, out_rx));

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let inbound = match decode_line::<HostMessage>(&line) {
                Ok(message) => Inbound::Message(message),
                Err(err) => Inbound::Malformed(
                    TestError::new(format!("Malformed host message: {err}")).with_details(line),
                ),
            };
            if in_tx.send(inbound).is_err() {
                break;
            }
        }
    });

    let mut worker = Worker::new(out_tx);
    worker.serve(in_rx).await;
    drop(worker);

    writer_task
        .await
        .context("worker output task panicked")?
        .context("writing worker messages")
}

async fn write_messages<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = encode_line(&message)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// A decoded line from the host.
enum Inbound {
    Message(HostMessage),
    Malformed(TestError),
}

/// How a group run ended.
enum GroupExit {
    Done,
    /// `Stop` arrived (or the host went away) while a test was running.
    Stopped,
}

struct Worker {
    out: mpsc::UnboundedSender<WorkerMessage>,
    init: Option<WorkerInit>,
    fixtures: WorkerFixtures,
    next_step_id: u32,
}

impl Worker {
    fn new(out: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            out,
            init: None,
            fixtures: WorkerFixtures::default(),
            next_step_id: 0,
        }
    }

    fn send(&self, message: WorkerMessage) {
        let _ = self.out.send(message);
    }

    async fn serve(&mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            match inbox.recv().await {
                Some(Inbound::Malformed(error)) => {
                    warn!(error = %error.message, "undecodable host message");
                    self.send(WorkerMessage::FatalError { error });
                }
                Some(Inbound::Message(HostMessage::Init(init))) => {
                    info!(
                        worker_index = init.worker_index,
                        project = %init.project,
                        hash = %init.worker_hash,
                        "worker initialised"
                    );
                    self.init = Some(init);
                }
                Some(Inbound::Message(HostMessage::Run(group))) => {
                    if let GroupExit::Stopped = self.run_group(group, &mut inbox).await {
                        break;
                    }
                }
                Some(Inbound::Message(HostMessage::Stop)) => break,
                None => {
                    debug!("host closed the connection");
                    break;
                }
            }
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        let env = self.env(0);
        let teardown_errors = self.fixtures.teardown_all(&env, &self.out).await;
        info!(errors = teardown_errors.len(), "worker stopping");
        self.send(WorkerMessage::Stopped { teardown_errors });
    }

    async fn run_group(
        &mut self,
        group: RunGroup,
        inbox: &mut mpsc::UnboundedReceiver<Inbound>,
    ) -> GroupExit {
        debug!(job_id = group.job_id, tests = group.tests.len(), "running group");

        for test in group.tests.iter() {
            self.send(WorkerMessage::TestBegin {
                test_id: test.test_id.clone(),
                attempt: test.attempt,
            });

            if test.skip {
                self.send(WorkerMessage::TestEnd {
                    test_id: test.test_id.clone(),
                    status: TestStatus::Skipped,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            let started = Instant::now();
            let out = self.out.clone();
            let outcome = {
                let run = self.run_test(test);
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        result = &mut run => break Some(result),
                        message = inbox.recv() => match message {
                            Some(Inbound::Message(HostMessage::Stop)) | None => break None,
                            Some(Inbound::Message(other)) => {
                                warn!(?other, "ignoring host message while a test is running");
                            }
                            Some(Inbound::Malformed(error)) => {
                                warn!(error = %error.message, "undecodable host message");
                                let _ = out.send(WorkerMessage::FatalError { error });
                            }
                        },
                    }
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Some((status, error)) => self.send(WorkerMessage::TestEnd {
                    test_id: test.test_id.clone(),
                    status,
                    duration_ms,
                    error,
                }),
                None => {
                    info!(test_id = %test.test_id, "stop requested during test; abandoning it");
                    self.send(WorkerMessage::TestEnd {
                        test_id: test.test_id.clone(),
                        status: TestStatus::Interrupted,
                        duration_ms,
                        error: Some(TestError::new("Test was interrupted")),
                    });
                    return GroupExit::Stopped;
                }
            }
        }

        self.send(WorkerMessage::GroupDone {
            job_id: group.job_id,
        });
        GroupExit::Done
    }

    /// Fixture setup, test body, fixture teardown.
    async fn run_test(&mut self, test: &TestPayload) -> (TestStatus, Option<TestError>) {
        let env = self.env(test.attempt);
        let mut test_scoped: Vec<(String, FixtureSpec)> = Vec::new();
        let mut error: Option<TestError> = None;

        for name in test.fixtures.iter() {
            let Some(spec) = self.fixture_spec(name) else {
                error = Some(TestError::new(format!("Unknown fixture '{name}'")));
                break;
            };
            if spec.worker_scoped && self.fixtures.is_active(name) {
                continue;
            }
            if let Some(setup) = spec.setup.as_deref() {
                let step_error = self
                    .run_step(test, &format!("fixture: {name}"), setup, &env, "Fixture setup")
                    .await;
                if step_error.is_some() {
                    error = step_error;
                    break;
                }
            }
            if spec.worker_scoped {
                self.fixtures.activate(name, &spec);
            } else {
                test_scoped.push((name.clone(), spec));
            }
        }

        if error.is_none() {
            let ctx = CommandContext {
                test_id: Some(&test.test_id),
                env: &env,
            };
            error = match run_shell(&test.cmd, ctx, &self.out).await {
                Ok(outcome) => outcome.error("Test command"),
                Err(err) => Some(TestError::new(format!("Test command could not run: {err:#}"))),
            };
        }

        while let Some((name, spec)) = test_scoped.pop() {
            let Some(teardown) = spec.teardown.as_deref() else {
                continue;
            };
            let step_error = self
                .run_step(test, &format!("fixture: {name}"), teardown, &env, "Fixture teardown")
                .await;
            if error.is_none() {
                error = step_error;
            }
        }

        match error {
            None => (TestStatus::Passed, None),
            Some(err) => (TestStatus::Failed, Some(err)),
        }
    }

    async fn run_step(
        &mut self,
        test: &TestPayload,
        title: &str,
        cmd: &str,
        env: &[(&'static str, String)],
        what: &str,
    ) -> Option<TestError> {
        let step_id = self.next_step_id;
        self.next_step_id += 1;
        self.send(WorkerMessage::StepBegin {
            test_id: test.test_id.clone(),
            step_id,
            title: title.to_string(),
        });

        let ctx = CommandContext {
            test_id: Some(&test.test_id),
            env,
        };
        let error = match run_shell(cmd, ctx, &self.out).await {
            Ok(outcome) => outcome.error(what),
            Err(err) => Some(TestError::new(format!("{what} could not run: {err:#}"))),
        };

        self.send(WorkerMessage::StepEnd {
            test_id: test.test_id.clone(),
            step_id,
            error: error.clone(),
        });
        error
    }

    fn fixture_spec(&self, name: &str) -> Option<FixtureSpec> {
        self.init.as_ref()?.fixtures.get(name).cloned()
    }

    fn env(&self, retry: u32) -> Vec<(&'static str, String)> {
        let mut env = vec![("TESTHERD_RETRY", retry.to_string())];
        if let Some(init) = &self.init {
            env.push(("TESTHERD_WORKER_INDEX", init.worker_index.to_string()));
            env.push(("TESTHERD_PROJECT", init.project.clone()));
            if let Some(dir) = &init.output_dir {
                env.push(("TESTHERD_OUTPUT_DIR", dir.display().to_string()));
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::types::TestId;

    fn payload(ordinal: usize, cmd: &str) -> TestPayload {
        TestPayload {
            test_id: TestId::new("p", "a", ordinal),
            title: format!("t{ordinal}"),
            cmd: cmd.to_string(),
            attempt: 0,
            fixtures: Vec::new(),
            skip: false,
        }
    }

    async fn exchange(messages: Vec<HostMessage>) -> Vec<WorkerMessage> {
        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let handle = tokio::spawn(run_worker(worker_read, worker_write));

        let (host_read, mut host_write) = tokio::io::split(host);
        for message in messages {
            host_write
                .write_all(encode_line(&message).unwrap().as_bytes())
                .await
                .unwrap();
        }

        let mut out = Vec::new();
        let mut lines = BufReader::new(host_read).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(decode_line::<WorkerMessage>(&line).unwrap());
        }
        handle.await.unwrap().unwrap();
        out
    }

    fn init() -> HostMessage {
        HostMessage::Init(WorkerInit {
            worker_index: 0,
            project: "p".to_string(),
            worker_hash: "p|".to_string(),
            output_dir: None,
            fixtures: BTreeMap::new(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_group_and_reports_statuses() {
        let out = exchange(vec![
            init(),
            HostMessage::Run(RunGroup {
                job_id: 7,
                tests: vec![
                    payload(0, "true"),
                    payload(1, "exit 2"),
                    TestPayload {
                        skip: true,
                        ..payload(2, "true")
                    },
                ],
            }),
            HostMessage::Stop,
        ])
        .await;

        let ends: Vec<TestStatus> = out
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::TestEnd { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            ends,
            vec![TestStatus::Passed, TestStatus::Failed, TestStatus::Skipped]
        );
        assert!(out.contains(&WorkerMessage::GroupDone { job_id: 7 }));
        assert_eq!(
            out.last(),
            Some(&WorkerMessage::Stopped {
                teardown_errors: Vec::new()
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fixture_steps_wrap_the_test() {
        let mut fixtures = BTreeMap::new();
        fixtures.insert(
            "tmp".to_string(),
            FixtureSpec {
                worker_scoped: false,
                setup: Some("true".to_string()),
                teardown: Some("true".to_string()),
            },
        );
        let out = exchange(vec![
            HostMessage::Init(WorkerInit {
                worker_index: 1,
                project: "p".to_string(),
                worker_hash: "p|".to_string(),
                output_dir: None,
                fixtures,
            }),
            HostMessage::Run(RunGroup {
                job_id: 1,
                tests: vec![TestPayload {
                    fixtures: vec!["tmp".to_string()],
                    ..payload(0, "true")
                }],
            }),
            HostMessage::Stop,
        ])
        .await;

        let steps: Vec<&str> = out
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::StepBegin { title, .. } => Some(title.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec!["fixture: tmp", "fixture: tmp"]);
    }

    #[tokio::test]
    async fn malformed_host_message_is_reported() {
        let (host, worker) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let handle = tokio::spawn(run_worker(worker_read, worker_write));

        let (host_read, mut host_write) = tokio::io::split(host);
        host_write.write_all(b"not json\n").await.unwrap();
        host_write
            .write_all(encode_line(&HostMessage::Stop).unwrap().as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(host_read).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(
            decode_line::<WorkerMessage>(&first).unwrap(),
            WorkerMessage::FatalError { .. }
        ));
        while lines.next_line().await.unwrap().is_some() {}
        handle.await.unwrap().unwrap();
    }
}
