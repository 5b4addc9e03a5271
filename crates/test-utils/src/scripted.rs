use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use testherd::errors::{Result, TestherdError};
use testherd::exec::{WorkerCommand, WorkerConnection, WorkerEvent, WorkerLauncher};
use testherd::protocol::{HostMessage, TestPayload, WorkerMessage};
use testherd::types::{TestError, TestStatus};

/// What a scripted worker does with a test, keyed by the test's title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Pass,
    Fail,
    /// Fail the first `n` attempts (across workers), then pass.
    FailTimes(u32),
    /// Never finish; only a stop or a kill ends it.
    Hang,
    /// The worker dies in the middle of the test.
    Crash,
    /// Like `Hang`, but a stop ends the test `failed`, as when the test's own
    /// process was killed by the same signal.
    FailOnStop,
    /// Print a line to stdout, then pass.
    Stdout(String),
    /// Pass after taking this long.
    PassAfter(Duration),
}

/// A test attempt seen by some scripted worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub worker_index: usize,
    pub title: String,
    pub attempt: u32,
}

#[derive(Default)]
struct Shared {
    behaviors: HashMap<String, Behavior>,
    /// Attempts started per title.
    attempts: HashMap<String, u32>,
    executed: Vec<Executed>,
    teardown_error: Option<String>,
    /// Time a worker takes to exit after `stop`.
    stop_delay: Duration,
    live: usize,
    peak_live: usize,
}

/// In-memory `WorkerLauncher` whose workers follow a per-title script.
///
/// Titles without a script pass. Every worker ends its event stream with a
/// single `Exited`, as real transports do.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    shared: Arc<Mutex<Shared>>,
    launches: Arc<AtomicUsize>,
    fail_launch: bool,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, title: &str, behavior: Behavior) -> Self {
        self.lock().behaviors.insert(title.to_string(), behavior);
        self
    }

    /// Every worker reports this fixture teardown error when stopped.
    pub fn with_teardown_error(self, message: &str) -> Self {
        self.lock().teardown_error = Some(message.to_string());
        self
    }

    /// Workers take `delay` to exit once asked to stop.
    pub fn with_stop_delay(self, delay: Duration) -> Self {
        self.lock().stop_delay = delay;
        self
    }

    /// Most workers alive at the same time.
    pub fn peak_live(&self) -> usize {
        self.lock().peak_live
    }

    /// Every launch fails.
    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.lock().executed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(
        &self,
        worker_index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerConnection>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_launch {
                return Err(TestherdError::WorkerLaunch("scripted launch failure".to_string()));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            {
                let mut shared = self.lock();
                shared.live += 1;
                shared.peak_live = shared.peak_live.max(shared.live);
            }

            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let worker = ScriptedWorker {
                worker_index,
                shared: Arc::clone(&self.shared),
                commands: commands_rx,
                events: events_tx,
            };
            tokio::spawn(worker.serve());

            Ok(WorkerConnection {
                pid: None,
                commands: commands_tx,
                events: events_rx,
            })
        })
    }
}

struct ScriptedWorker {
    worker_index: usize,
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// How a worker's life ended.
enum End {
    Stopped,
    Killed,
    Crashed,
}

impl ScriptedWorker {
    fn emit(&self, message: WorkerMessage) {
        let _ = self.events.send(WorkerEvent::Message(message));
    }

    async fn serve(mut self) {
        let end = loop {
            match self.commands.recv().await {
                Some(WorkerCommand::Send(HostMessage::Init(_))) => {}
                Some(WorkerCommand::Send(HostMessage::Run(group))) => {
                    let mut ended = None;
                    for test in group.tests.iter() {
                        if let Some(end) = self.run_test(test).await {
                            ended = Some(end);
                            break;
                        }
                    }
                    match ended {
                        Some(end) => break end,
                        None => self.emit(WorkerMessage::GroupDone {
                            job_id: group.job_id,
                        }),
                    }
                }
                Some(WorkerCommand::Send(HostMessage::Stop)) => break End::Stopped,
                Some(WorkerCommand::Kill) | None => break End::Killed,
            }
        };

        let code = match end {
            End::Stopped => {
                let (teardown_error, delay) = {
                    let shared = self.shared.lock().unwrap();
                    (shared.teardown_error.clone(), shared.stop_delay)
                };
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wait_for_kill() => {}
                    }
                }
                let teardown_errors = teardown_error
                    .map(|message| vec![TestError::new(message)])
                    .unwrap_or_default();
                self.emit(WorkerMessage::Stopped { teardown_errors });
                Some(0)
            }
            End::Killed => None,
            End::Crashed => Some(1),
        };
        self.shared.lock().unwrap().live -= 1;
        let _ = self.events.send(WorkerEvent::Exited { code });
    }

    async fn wait_for_kill(&mut self) {
        while let Some(command) = self.commands.recv().await {
            if matches!(command, WorkerCommand::Kill) {
                return;
            }
        }
    }

    /// Run one test; `Some` when the worker's life ends during it.
    async fn run_test(&mut self, test: &TestPayload) -> Option<End> {
        let behavior = {
            let mut shared = self.shared.lock().unwrap();
            let seen = shared.attempts.entry(test.title.clone()).or_insert(0);
            *seen += 1;
            let seen = *seen;
            shared.executed.push(Executed {
                worker_index: self.worker_index,
                title: test.title.clone(),
                attempt: test.attempt,
            });
            match shared.behaviors.get(&test.title).cloned() {
                Some(Behavior::FailTimes(n)) if seen > n => Behavior::Pass,
                Some(Behavior::FailTimes(_)) => Behavior::Fail,
                Some(other) => other,
                None => Behavior::Pass,
            }
        };

        self.emit(WorkerMessage::TestBegin {
            test_id: test.test_id.clone(),
            attempt: test.attempt,
        });
        let end = |status: TestStatus, error: Option<TestError>| WorkerMessage::TestEnd {
            test_id: test.test_id.clone(),
            status,
            duration_ms: 1,
            error,
        };

        match behavior {
            Behavior::Pass => self.emit(end(TestStatus::Passed, None)),
            Behavior::Stdout(line) => {
                self.emit(WorkerMessage::Stdout {
                    test_id: Some(test.test_id.clone()),
                    chunk: format!("{line}\n"),
                });
                self.emit(end(TestStatus::Passed, None));
            }
            Behavior::PassAfter(delay) => {
                tokio::time::sleep(delay).await;
                self.emit(end(TestStatus::Passed, None));
            }
            Behavior::Fail | Behavior::FailTimes(_) => self.emit(end(
                TestStatus::Failed,
                Some(TestError::new(format!("{} failed", test.title))),
            )),
            Behavior::Crash => return Some(End::Crashed),
            Behavior::Hang => {
                return match self.commands.recv().await {
                    Some(WorkerCommand::Send(HostMessage::Stop)) => {
                        self.emit(end(TestStatus::Interrupted, None));
                        Some(End::Stopped)
                    }
                    _ => Some(End::Killed),
                };
            }
            Behavior::FailOnStop => {
                return match self.commands.recv().await {
                    Some(WorkerCommand::Send(HostMessage::Stop)) => {
                        self.emit(end(
                            TestStatus::Failed,
                            Some(TestError::new("Test was terminated by a signal")),
                        ));
                        Some(End::Stopped)
                    }
                    _ => Some(End::Killed),
                };
            }
        }
        None
    }
}
