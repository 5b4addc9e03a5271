// src/coordinator.rs

//! Phase-by-phase execution.
//!
//! The coordinator walks the phases in order, threading a
//! [`CoordinatorState`] through the loop: the projects that fully succeeded so
//! far and whether to stop. Deciding what a phase runs ([`plan_phase`]) is a
//! pure function of that state; running it is the async shell around it.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::dag::Phase;
use crate::dispatch::Dispatcher;
use crate::reporter::Reporter;
use crate::results::{TestRecords, TestResult};
use crate::suite::{Suite, TestGroup};
use crate::types::{ProjectName, TestStatus};

/// A phase ready to run: its groups and the dispatcher that will run them.
pub struct PhaseRun {
    pub phase: Phase,
    pub groups: Vec<TestGroup>,
    pub dispatcher: Dispatcher,
}

/// Accumulator threaded through the phase loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorState {
    pub successful: HashSet<ProjectName>,
    /// Set once a phase reported worker errors; later phases do not run.
    pub stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub runnable: Vec<ProjectName>,
    /// Projects with a dependency that did not fully succeed.
    pub skipped: Vec<ProjectName>,
}

/// Split a phase's projects by whether all their dependencies succeeded.
pub fn plan_phase(phase: &Phase, config: &ConfigFile, state: &CoordinatorState) -> PhasePlan {
    let (runnable, skipped): (Vec<ProjectName>, Vec<ProjectName>) = phase.projects.iter().cloned().partition(|name| {
        config
            .project(name)
            .is_none_or(|p| p.deps.iter().all(|d| state.successful.contains(d)))
    });
    PhasePlan { runnable, skipped }
}

pub struct RunCoordinator<'a> {
    config: &'a ConfigFile,
    suite: &'a Suite,
    reporter: Arc<dyn Reporter>,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(config: &'a ConfigFile, suite: &'a Suite, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            config,
            suite,
            reporter,
        }
    }

    /// Run every phase in order. Tests of dependency-skipped projects are
    /// recorded in `skipped`.
    pub async fn run(&self, phases: &mut [PhaseRun], skipped: &mut TestRecords) -> CoordinatorState {
        let mut state = CoordinatorState::default();
        for run in phases.iter_mut() {
            if state.stopped {
                warn!(phase = run.phase.index, "not running phase after worker errors");
                continue;
            }
            state = self.run_phase(state, run, skipped).await;
        }
        state
    }

    async fn run_phase(
        &self,
        state: CoordinatorState,
        run: &mut PhaseRun,
        skipped: &mut TestRecords,
    ) -> CoordinatorState {
        let plan = plan_phase(&run.phase, self.config, &state);
        info!(
            phase = run.phase.index,
            runnable = ?plan.runnable,
            skipped = ?plan.skipped,
            "starting phase"
        );

        for project in plan.skipped.iter() {
            self.skip_project(project, skipped);
        }
        self.clean_output_dirs(&run.phase.projects).await;

        let groups: Vec<TestGroup> = std::mem::take(&mut run.groups)
            .into_iter()
            .filter(|g| plan.runnable.contains(&g.project))
            .collect();
        run.dispatcher.run(groups).await;
        run.dispatcher.stop().await;

        let mut next = state;
        for project in plan.runnable {
            if self.project_succeeded(&project, run.dispatcher.records()) {
                next.successful.insert(project);
            } else {
                debug!(project = %project, "project did not fully succeed");
            }
        }
        if run.dispatcher.has_worker_errors() {
            warn!(phase = run.phase.index, "worker errors in phase; stopping");
            next.stopped = true;
        }
        next
    }

    fn project_succeeded(&self, project: &str, records: &TestRecords) -> bool {
        let Some(project_suite) = self.suite.project(project) else {
            return true;
        };
        project_suite.tests().all(|test| {
            records
                .get(&test.id)
                .is_some_and(|record| record.outcome().is_ok())
        })
    }

    fn skip_project(&self, project: &str, skipped: &mut TestRecords) {
        let Some(project_suite) = self.suite.project(project) else {
            return;
        };
        info!(project = %project, "skipping project: a dependency did not succeed");
        for test in project_suite.tests() {
            let record = skipped.entry(test);
            let result = TestResult::new(TestStatus::Skipped, record.next_retry());
            self.reporter.on_test_begin(test, result.retry);
            record.push(result.clone());
            self.reporter.on_test_end(test, &result);
        }
    }

    async fn clean_output_dirs(&self, projects: &[ProjectName]) {
        for name in projects {
            let Some(dir) = self.config.project(name).and_then(|p| p.output_dir.as_ref()) else {
                continue;
            };
            let dir = self.config.resolve(dir);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(project = %name, dir = %dir.display(), "removed output directory"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(project = %name, dir = %dir.display(), error = %err, "could not remove output directory")
                }
            }
        }
    }
}
