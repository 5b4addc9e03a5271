// src/tasks/context.rs

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigFile;
use crate::coordinator::{CoordinatorState, PhaseRun};
use crate::dag::Phase;
use crate::exec::WorkerLauncher;
use crate::plugin::Plugin;
use crate::reporter::InternalReporter;
use crate::results::{TestRecord, TestRecords};
use crate::suite::{LoadError, Suite, SuiteLoader};
use crate::types::TestError;

/// Mutable state of one invocation, handed to every pipeline step.
pub struct RunContext {
    pub config: ConfigFile,
    pub reporter: Arc<InternalReporter>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub loader: Arc<dyn SuiteLoader>,
    pub launcher: Arc<dyn WorkerLauncher>,

    /// Phase order, computed before the pipeline starts.
    pub phase_order: Vec<Phase>,
    pub suite: Suite,
    pub load_errors: Vec<LoadError>,
    /// One entry per phase, each with its own dispatcher.
    pub phases: Vec<PhaseRun>,
    /// Records of tests skipped because a dependency did not succeed.
    pub skipped: TestRecords,
    pub coordinator: Option<CoordinatorState>,

    /// User interrupt (Ctrl-C).
    pub interrupt: CancellationToken,
    /// Child of `interrupt` held by the dispatchers; also cancelled when the
    /// pipeline unwinds.
    pub dispatch_token: CancellationToken,

    /// Errors not attributable to any test, flushed once at the end.
    pub fatal_errors: Vec<TestError>,
    pub worker_errors: bool,
}

impl RunContext {
    pub fn new(
        config: ConfigFile,
        reporter: Arc<InternalReporter>,
        loader: Arc<dyn SuiteLoader>,
        launcher: Arc<dyn WorkerLauncher>,
        interrupt: CancellationToken,
    ) -> Self {
        let dispatch_token = interrupt.child_token();
        Self {
            config,
            reporter,
            plugins: Vec::new(),
            loader,
            launcher,
            phase_order: Vec::new(),
            suite: Suite::default(),
            load_errors: Vec::new(),
            phases: Vec::new(),
            skipped: TestRecords::new(),
            coordinator: None,
            interrupt,
            dispatch_token,
            fatal_errors: Vec::new(),
            worker_errors: false,
        }
    }

    /// Final per-test records in suite order.
    ///
    /// Tests that never reached a dispatcher (a later phase after worker
    /// errors, an abandoned run) come back as pending records.
    pub fn test_records(&self) -> Vec<TestRecord> {
        self.suite
            .all_tests()
            .map(|test| {
                self.skipped
                    .get(&test.id)
                    .or_else(|| {
                        self.phases
                            .iter()
                            .find_map(|run| run.dispatcher.records().get(&test.id))
                    })
                    .cloned()
                    .unwrap_or_else(|| TestRecord::new(Arc::clone(test)))
            })
            .collect()
    }
}
