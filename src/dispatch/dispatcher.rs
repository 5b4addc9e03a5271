// src/dispatch/dispatcher.rs

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigFile;
use crate::exec::WorkerLauncher;
use crate::protocol::{FixtureSpec, WorkerInit, WorkerMessage};
use crate::reporter::Reporter;
use crate::results::{TestRecords, TestResult, TestStep};
use crate::suite::{TestCase, TestGroup};
use crate::types::{ProjectName, TestError, TestId, TestStatus};

use super::job::{
    DispatchEvent, JobEnd, JobEnv, JobReport, JobSpec, WorkerHandle, WorkerSlot, retire_worker,
    run_job,
};

pub const WORKER_CRASH_MESSAGE: &str = "Worker process exited unexpectedly";

/// Knobs a dispatcher needs from the configuration.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Size of the worker pool.
    pub workers: usize,
    /// Per-project cap on busy workers; projects not listed use `workers`.
    pub project_limits: HashMap<ProjectName, usize>,
    /// Time a worker gets between `stop` and a kill.
    pub stop_grace: Duration,
    pub fixtures: BTreeMap<String, FixtureSpec>,
    pub output_dirs: HashMap<ProjectName, PathBuf>,
}

impl DispatcherSettings {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            project_limits: HashMap::new(),
            stop_grace: Duration::from_secs(2),
            fixtures: BTreeMap::new(),
            output_dirs: HashMap::new(),
        }
    }

    pub fn from_config(config: &ConfigFile) -> Self {
        let run = &config.config;
        Self {
            workers: run.workers.max(1),
            project_limits: config
                .project
                .iter()
                .map(|p| (p.name.clone(), p.effective_workers(run)))
                .collect(),
            stop_grace: run.stop_grace(),
            fixtures: config
                .fixture
                .iter()
                .map(|(name, f)| (name.clone(), FixtureSpec::from(f)))
                .collect(),
            output_dirs: config
                .project
                .iter()
                .filter_map(|p| {
                    p.output_dir
                        .as_ref()
                        .map(|dir| (p.name.clone(), config.resolve(dir)))
                })
                .collect(),
        }
    }

    fn limit_for(&self, project: &str) -> usize {
        self.project_limits
            .get(project)
            .copied()
            .unwrap_or(self.workers)
            .clamp(1, self.workers)
    }
}

/// A group waiting for a worker.
#[derive(Debug, Clone)]
struct Job {
    project: ProjectName,
    hash: String,
    tests: Vec<Arc<TestCase>>,
}

/// Owns the worker pool for one phase and drives groups through it.
///
/// All scheduling state lives here and is only touched from [`run`] and
/// [`stop`], which consume the single event channel fed by job tasks.
///
/// [`run`]: Dispatcher::run
/// [`stop`]: Dispatcher::stop
pub struct Dispatcher {
    settings: DispatcherSettings,
    reporter: Arc<dyn Reporter>,
    interrupt: CancellationToken,
    env: JobEnv,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    tasks: JoinSet<()>,

    queue: VecDeque<Job>,
    idle: Vec<WorkerHandle>,
    /// Busy job id -> project.
    busy: HashMap<u64, ProjectName>,
    /// Workers asked to stop that have not exited yet.
    retiring: usize,
    steps: HashMap<(TestId, u32), TestStep>,
    records: TestRecords,
    /// Worker hash of the group each test arrived in; retries reuse it.
    hashes: HashMap<TestId, String>,

    next_job_id: u64,
    next_worker_index: usize,
    interrupted: bool,
    worker_errors: bool,
    fatal_errors: Vec<TestError>,
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherSettings,
        launcher: Arc<dyn WorkerLauncher>,
        reporter: Arc<dyn Reporter>,
        interrupt: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let env = JobEnv {
            launcher,
            events: tx,
            interrupt: interrupt.clone(),
            stop_grace: settings.stop_grace,
        };
        Self {
            settings,
            reporter,
            interrupt,
            env,
            events: rx,
            tasks: JoinSet::new(),
            queue: VecDeque::new(),
            idle: Vec::new(),
            busy: HashMap::new(),
            retiring: 0,
            steps: HashMap::new(),
            records: TestRecords::new(),
            hashes: HashMap::new(),
            next_job_id: 0,
            next_worker_index: 0,
            interrupted: false,
            worker_errors: false,
            fatal_errors: Vec::new(),
        }
    }

    /// Run every group to completion, including retries.
    ///
    /// Resolves once no job is queued or running, also after an interrupt.
    pub async fn run(&mut self, groups: Vec<TestGroup>) {
        for group in groups {
            if group.tests.is_empty() {
                continue;
            }
            for test in group.tests.iter() {
                self.records.entry(test);
                self.hashes
                    .insert(test.id.clone(), group.worker_hash.clone());
            }
            self.queue.push_back(Job {
                project: group.project,
                hash: group.worker_hash,
                tests: group.tests,
            });
        }
        info!(jobs = self.queue.len(), workers = self.settings.workers, "dispatching");

        if self.interrupt.is_cancelled() {
            self.on_interrupt();
        }
        self.fill();

        while !self.queue.is_empty() || !self.busy.is_empty() {
            tokio::select! {
                biased;
                _ = self.interrupt.cancelled(), if !self.interrupted => self.on_interrupt(),
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    // Unreachable while `self.env` holds a sender.
                    None => break,
                },
            }
            self.fill();
        }
        debug!("dispatcher idle");
    }

    /// Retire every idle worker and wait for all worker tasks to finish.
    ///
    /// Jobs still finishing hand their workers back while this runs; those
    /// are retired too, so every worker gets to report its teardown errors.
    pub async fn stop(&mut self) {
        loop {
            for worker in std::mem::take(&mut self.idle) {
                self.retire(worker);
            }
            if let Some(Err(err)) = self.tasks.join_next().await {
                error!(error = %err, "worker task panicked");
                self.fatal_errors
                    .push(TestError::new(format!("Worker task panicked: {err}")));
            }
            while let Ok(event) = self.events.try_recv() {
                self.handle(event);
            }
            if self.tasks.is_empty() && self.idle.is_empty() {
                break;
            }
        }
    }

    /// `true` once any worker crashed or could not be launched.
    pub fn has_worker_errors(&self) -> bool {
        self.worker_errors
    }

    /// Errors not attributable to any test, drained.
    pub fn take_fatal_errors(&mut self) -> Vec<TestError> {
        std::mem::take(&mut self.fatal_errors)
    }

    pub fn records(&self) -> &TestRecords {
        &self.records
    }

    pub fn into_records(self) -> TestRecords {
        self.records
    }

    /// Worker processes alive or on their way out.
    fn live_workers(&self) -> usize {
        self.idle.len() + self.busy.len() + self.retiring
    }

    fn busy_for(&self, project: &str) -> usize {
        self.busy.values().filter(|p| p.as_str() == project).count()
    }

    /// Greedy FIFO: start every queued job that fits.
    fn fill(&mut self) {
        if self.interrupted {
            return;
        }
        let mut i = 0;
        while i < self.queue.len() && self.busy.len() < self.settings.workers {
            let (project, hash) = {
                let job = &self.queue[i];
                (job.project.clone(), job.hash.clone())
            };
            if self.busy_for(&project) >= self.settings.limit_for(&project) {
                i += 1;
                continue;
            }

            let slot = if let Some(pos) = self.idle.iter().position(|w| w.hash == hash) {
                WorkerSlot::Reuse(self.idle.swap_remove(pos))
            } else if self.live_workers() < self.settings.workers {
                WorkerSlot::Launch(self.worker_init(&project, &hash))
            } else {
                // Pool is full. Free a slot held by an idle worker for another
                // hash; the job launches once that worker has exited.
                let victim = self.idle.iter().position(|w| w.hash != hash);
                if let (0, Some(pos)) = (self.retiring, victim) {
                    let victim = self.idle.swap_remove(pos);
                    self.retire(victim);
                }
                i += 1;
                continue;
            };

            if let Some(job) = self.queue.remove(i) {
                self.start(job, slot);
            }
        }
    }

    fn worker_init(&mut self, project: &str, hash: &str) -> WorkerInit {
        let worker_index = self.next_worker_index;
        self.next_worker_index += 1;
        WorkerInit {
            worker_index,
            project: project.to_string(),
            worker_hash: hash.to_string(),
            output_dir: self.settings.output_dirs.get(project).cloned(),
            fixtures: self.settings.fixtures.clone(),
        }
    }

    fn start(&mut self, job: Job, slot: WorkerSlot) {
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let tests: Vec<(Arc<TestCase>, u32)> = job
            .tests
            .into_iter()
            .map(|test| {
                let retry = self.records.entry(&test).next_retry();
                (test, retry)
            })
            .collect();

        debug!(job_id, project = %job.project, tests = tests.len(), "starting job");
        self.busy.insert(job_id, job.project.clone());
        let spec = JobSpec {
            job_id,
            project: job.project,
            hash: job.hash,
            tests,
        };
        self.tasks.spawn(run_job(spec, slot, self.env.clone()));
    }

    fn retire(&mut self, worker: WorkerHandle) {
        debug!(worker_index = worker.worker_index, failures = worker.failures, "retiring worker");
        self.retiring += 1;
        self.tasks.spawn(retire_worker(worker, self.env.clone()));
    }

    fn enqueue_back(&mut self, project: ProjectName, hash: String, tests: Vec<Arc<TestCase>>) {
        self.queue.push_back(Job { project, hash, tests });
    }

    fn enqueue_front(&mut self, project: ProjectName, hash: String, tests: Vec<Arc<TestCase>>) {
        self.queue.push_front(Job { project, hash, tests });
    }

    fn handle(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Message {
                worker_index,
                message,
            } => self.on_message(worker_index, message),
            DispatchEvent::JobFinished(report) => self.on_job_finished(report),
            DispatchEvent::WorkerStopped {
                worker_index,
                teardown_errors,
            } => {
                debug!(worker_index, errors = teardown_errors.len(), "worker stopped");
                self.fatal_errors.extend(teardown_errors);
            }
            DispatchEvent::WorkerRetired {
                worker_index,
                teardown_errors,
            } => {
                debug!(worker_index, errors = teardown_errors.len(), "worker retired");
                self.retiring = self.retiring.saturating_sub(1);
                self.fatal_errors.extend(teardown_errors);
            }
        }
    }

    fn on_message(&mut self, worker_index: usize, message: WorkerMessage) {
        match message {
            WorkerMessage::TestBegin { test_id, attempt } => {
                let Some(record) = self.records.get_mut(&test_id) else {
                    warn!(worker_index, test_id = %test_id, "testBegin for unknown test");
                    return;
                };
                record.status = TestStatus::Running;
                self.reporter.on_test_begin(&record.test, attempt);
            }
            WorkerMessage::TestEnd {
                test_id,
                status,
                duration_ms,
                error,
            } => {
                let result = TestResult {
                    status,
                    retry: 0,
                    duration: Duration::from_millis(duration_ms),
                    error,
                    worker_index: Some(worker_index),
                };
                self.finish_attempt(&test_id, result, false);
            }
            WorkerMessage::StepBegin {
                test_id,
                step_id,
                title,
            } => {
                let Some(record) = self.records.get(&test_id) else {
                    return;
                };
                let step = TestStep { id: step_id, title };
                self.reporter.on_step_begin(&record.test, &step);
                self.steps.insert((test_id, step_id), step);
            }
            WorkerMessage::StepEnd {
                test_id,
                step_id,
                error,
            } => {
                let step = self.steps.remove(&(test_id.clone(), step_id));
                if let (Some(record), Some(step)) = (self.records.get(&test_id), step) {
                    self.reporter.on_step_end(&record.test, &step, error.as_ref());
                }
            }
            WorkerMessage::Stdout { test_id, chunk } => {
                let test = test_id.as_ref().and_then(|id| self.records.get(id));
                self.reporter.on_std_out(&chunk, test.map(|r| r.test.as_ref()));
            }
            WorkerMessage::Stderr { test_id, chunk } => {
                let test = test_id.as_ref().and_then(|id| self.records.get(id));
                self.reporter.on_std_err(&chunk, test.map(|r| r.test.as_ref()));
            }
            WorkerMessage::GroupDone { .. } => {}
            WorkerMessage::Stopped { teardown_errors } => {
                for error in teardown_errors {
                    self.fatal_errors.push(error);
                }
            }
            WorkerMessage::FatalError { error } => {
                error!(worker_index, error = %error.message, "worker reported a fatal error");
                self.fatal_errors.push(error);
            }
        }
    }

    /// Record the end of an attempt and queue a retry if it is due.
    ///
    /// An attempt that crashed its worker leaves room for one more try at most.
    fn finish_attempt(&mut self, test_id: &TestId, mut result: TestResult, crashed: bool) {
        let Some(record) = self.records.get_mut(test_id) else {
            warn!(test_id = %test_id, "result for unknown test");
            return;
        };
        result.retry = record.next_retry();
        let status = result.status;
        record.push(result.clone());
        if crashed {
            record.cap_after_crash();
        }
        self.reporter.on_test_end(&record.test, &result);

        if status.is_retriable() && record.can_retry() && !self.interrupted {
            let test = Arc::clone(&record.test);
            let attempt = record.next_retry();
            let hash = self.hash_of(&test);
            info!(test_id = %test_id, attempt, "scheduling retry");
            self.enqueue_back(test.project.clone(), hash, vec![test]);
        }
    }

    /// Report a test that never reached a worker as ended with `status`.
    fn end_unstarted(&mut self, test_id: &TestId, status: TestStatus, error: Option<TestError>) {
        let Some(record) = self.records.get(test_id) else {
            return;
        };
        self.reporter.on_test_begin(&record.test, record.next_retry());
        let mut result = TestResult::new(status, 0);
        result.error = error;
        self.finish_attempt(test_id, result, false);
    }

    fn hash_of(&self, test: &TestCase) -> String {
        self.hashes
            .get(&test.id)
            .cloned()
            .unwrap_or_else(|| format!("{}|", test.project))
    }

    fn tests_for(&self, ids: &[TestId]) -> Vec<Arc<TestCase>> {
        ids.iter()
            .filter_map(|id| self.records.get(id).map(|r| Arc::clone(&r.test)))
            .collect()
    }

    fn on_job_finished(&mut self, report: JobReport) {
        self.busy.remove(&report.job_id);
        let JobReport {
            worker_index,
            project,
            hash,
            worker,
            unstarted,
            end,
            ..
        } = report;

        match end {
            JobEnd::Completed => {
                if let Some(worker) = worker {
                    if worker.failures > 0 || self.interrupted {
                        self.retire(worker);
                    } else {
                        self.idle.push(worker);
                    }
                }
            }
            JobEnd::TimedOut => {
                if self.interrupted {
                    self.interrupt_tests(&unstarted);
                } else if !unstarted.is_empty() {
                    let tests = self.tests_for(&unstarted);
                    debug!(worker_index, tests = tests.len(), "re-queueing tests after timeout");
                    self.enqueue_front(project, hash, tests);
                }
            }
            JobEnd::Interrupted => self.interrupt_tests(&unstarted),
            JobEnd::Crashed { running, exit_code } => {
                self.worker_errors = true;
                let details = match exit_code {
                    Some(code) => format!("worker {worker_index} exited with code {code}"),
                    None => format!("worker {worker_index} was terminated"),
                };
                error!(worker_index, ?exit_code, "worker crashed");
                let crash_error = TestError::new(WORKER_CRASH_MESSAGE).with_details(details);

                if let Some(test_id) = running {
                    let result = TestResult::new(TestStatus::Failed, 0).with_error(crash_error.clone());
                    let result = TestResult {
                        worker_index: Some(worker_index),
                        ..result
                    };
                    self.finish_attempt(&test_id, result, true);
                }

                let mut requeue = Vec::new();
                for test_id in unstarted.iter() {
                    let retries_left = self
                        .records
                        .get(test_id)
                        .is_some_and(|r| r.attempts() + 1 < r.max_attempts());
                    if retries_left && !self.interrupted {
                        requeue.push(test_id.clone());
                    } else if self.interrupted {
                        self.end_unstarted(test_id, TestStatus::Interrupted, None);
                    } else {
                        self.end_unstarted(test_id, TestStatus::Failed, Some(crash_error.clone()));
                    }
                }
                if !requeue.is_empty() {
                    let tests = self.tests_for(&requeue);
                    self.enqueue_back(project, hash, tests);
                }
            }
            JobEnd::LaunchFailed(message) => {
                self.worker_errors = true;
                let launch_error = TestError::new("Failed to launch worker").with_details(message);
                for test_id in unstarted.iter() {
                    self.end_unstarted(test_id, TestStatus::Failed, Some(launch_error.clone()));
                }
            }
        }
    }

    fn on_interrupt(&mut self) {
        if self.interrupted {
            return;
        }
        self.interrupted = true;
        warn!(queued = self.queue.len(), busy = self.busy.len(), "interrupted; no more groups will start");

        let queued: Vec<TestId> = std::mem::take(&mut self.queue)
            .into_iter()
            .flat_map(|job| job.tests.into_iter().map(|t| t.id.clone()))
            .collect();
        self.interrupt_tests(&queued);
        // Busy workers observe the same token and stop themselves.
    }

    fn interrupt_tests(&mut self, ids: &[TestId]) {
        for test_id in ids {
            self.end_unstarted(test_id, TestStatus::Interrupted, None);
        }
    }
}
