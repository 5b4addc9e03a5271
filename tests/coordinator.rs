// tests/coordinator.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use testherd::config::ConfigFile;
use testherd::coordinator::{PhaseRun, RunCoordinator};
use testherd::dag::build_phases;
use testherd::dispatch::{Dispatcher, DispatcherSettings};
use testherd::reporter::Reporter;
use testherd::results::TestRecords;
use testherd::suite::{ProjectSuite, Suite, TestCase, TestFile, create_test_groups};
use testherd::types::{TestOutcome, TestStatus};
use testherd_test_utils::builders::{ConfigFileBuilder, ProjectBuilder, TestCaseBuilder};
use testherd_test_utils::{Behavior, RecordingReporter, ScriptedLauncher, init_tracing, with_timeout};
use tokio_util::sync::CancellationToken;

fn suite(tests: &[Arc<TestCase>]) -> Suite {
    let mut projects: Vec<ProjectSuite> = Vec::new();
    for test in tests {
        match projects.iter_mut().find(|p| p.project == test.project) {
            Some(p) => p.files[0].tests.push(Arc::clone(test)),
            None => projects.push(ProjectSuite {
                project: test.project.clone(),
                files: vec![TestFile {
                    path: PathBuf::from("a.test.toml"),
                    tests: vec![Arc::clone(test)],
                }],
            }),
        }
    }
    Suite { projects }
}

fn phase_runs(
    config: &ConfigFile,
    suite: &Suite,
    launcher: &ScriptedLauncher,
    reporter: &Arc<RecordingReporter>,
) -> Vec<PhaseRun> {
    let mut settings = DispatcherSettings::from_config(config);
    settings.stop_grace = Duration::from_millis(50);
    build_phases(&config.project)
        .unwrap()
        .into_iter()
        .map(|phase| {
            let groups = phase
                .projects
                .iter()
                .filter_map(|name| suite.project(name))
                .flat_map(|ps| create_test_groups(config, ps, 2))
                .collect();
            PhaseRun {
                phase,
                groups,
                dispatcher: Dispatcher::new(
                    settings.clone(),
                    Arc::new(launcher.clone()),
                    Arc::clone(reporter) as Arc<dyn Reporter>,
                    CancellationToken::new(),
                ),
            }
        })
        .collect()
}

fn two_projects() -> ConfigFile {
    ConfigFileBuilder::new()
        .with_project(ProjectBuilder::new("A").build())
        .with_project(ProjectBuilder::new("B").dep("A").build())
        .build()
}

#[tokio::test]
async fn dependents_of_a_failing_project_are_skipped() {
    init_tracing();
    let config = two_projects();
    let a = TestCaseBuilder::new("A", "a fails").build();
    let b = TestCaseBuilder::new("B", "b never runs").build();
    let suite = suite(&[Arc::clone(&a), Arc::clone(&b)]);

    let launcher = ScriptedLauncher::new().with("a fails", Behavior::Fail);
    let reporter = Arc::new(RecordingReporter::new());
    let mut phases = phase_runs(&config, &suite, &launcher, &reporter);
    let mut skipped = TestRecords::new();

    let coordinator = RunCoordinator::new(&config, &suite, reporter.clone());
    let state = with_timeout(coordinator.run(&mut phases, &mut skipped)).await;

    assert!(state.successful.is_empty());
    assert!(!state.stopped);
    assert_eq!(
        phases[0].dispatcher.records().get(&a.id).unwrap().outcome(),
        TestOutcome::Failed
    );
    assert_eq!(skipped.get(&b.id).unwrap().outcome(), TestOutcome::Skipped);
    assert_eq!(reporter.statuses_of("b never runs"), vec![TestStatus::Skipped]);
    assert!(launcher.executed().iter().all(|e| e.title != "b never runs"));
}

#[tokio::test]
async fn flaky_dependency_still_counts_as_successful() {
    let config = ConfigFileBuilder::new()
        .retries(1)
        .with_project(ProjectBuilder::new("A").build())
        .with_project(ProjectBuilder::new("B").dep("A").build())
        .build();
    let a = TestCaseBuilder::new("A", "a flaky").retries(1).build();
    let b = TestCaseBuilder::new("B", "b runs").build();
    let suite = suite(&[a, Arc::clone(&b)]);

    let launcher = ScriptedLauncher::new().with("a flaky", Behavior::FailTimes(1));
    let reporter = Arc::new(RecordingReporter::new());
    let mut phases = phase_runs(&config, &suite, &launcher, &reporter);
    let mut skipped = TestRecords::new();

    let coordinator = RunCoordinator::new(&config, &suite, reporter.clone());
    let state = with_timeout(coordinator.run(&mut phases, &mut skipped)).await;

    assert!(state.successful.contains("A"));
    assert!(state.successful.contains("B"));
    assert!(skipped.is_empty());
    assert_eq!(
        phases[1].dispatcher.records().get(&b.id).unwrap().outcome(),
        TestOutcome::Passed
    );
}

#[tokio::test]
async fn worker_errors_stop_later_phases() {
    let config = two_projects();
    let a = TestCaseBuilder::new("A", "a crashes").build();
    let b = TestCaseBuilder::new("B", "b waits").build();
    let suite = suite(&[a, Arc::clone(&b)]);

    let launcher = ScriptedLauncher::new().with("a crashes", Behavior::Crash);
    let reporter = Arc::new(RecordingReporter::new());
    let mut phases = phase_runs(&config, &suite, &launcher, &reporter);
    let mut skipped = TestRecords::new();

    let coordinator = RunCoordinator::new(&config, &suite, reporter.clone());
    let state = with_timeout(coordinator.run(&mut phases, &mut skipped)).await;

    assert!(state.stopped);
    assert!(phases[1].dispatcher.records().get(&b.id).is_none());
    assert!(skipped.get(&b.id).is_none());
}

#[tokio::test]
async fn output_directories_are_removed_before_their_phase_runs() {
    let scratch = tempfile::tempdir().unwrap();
    let out_a = scratch.path().join("out-a");
    let out_b = scratch.path().join("out-b");
    for dir in [&out_a, &out_b] {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("stale.txt"), "left over").unwrap();
    }

    let config = ConfigFileBuilder::new()
        .with_project(ProjectBuilder::new("A").output_dir(&out_a).build())
        .with_project(ProjectBuilder::new("B").dep("A").output_dir(&out_b).build())
        .build();
    let a = TestCaseBuilder::new("A", "a").build();
    let b = TestCaseBuilder::new("B", "b").build();
    let suite = suite(&[a, b]);

    let launcher = ScriptedLauncher::new();
    let reporter = Arc::new(RecordingReporter::new());
    let mut phases = phase_runs(&config, &suite, &launcher, &reporter);
    let mut skipped = TestRecords::new();

    let coordinator = RunCoordinator::new(&config, &suite, reporter.clone());
    let state = with_timeout(coordinator.run(&mut phases, &mut skipped)).await;

    assert!(state.successful.contains("B"));
    assert!(!out_a.join("stale.txt").exists());
    assert!(!out_b.join("stale.txt").exists());
}
