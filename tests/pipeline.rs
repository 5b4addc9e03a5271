// tests/pipeline.rs

use std::sync::{Arc, Mutex};

use testherd::config::{ConfigFile, RawConfigFile, RunSection};
use testherd::exec::InProcessLauncher;
use testherd::fs::mock::MockFileSystem;
use testherd::plugin::Plugin;
use testherd::suite::{Suite, TomlSuiteLoader};
use testherd::tasks::BoxFuture;
use testherd::types::{RunStatus, TestOutcome};
use testherd::{RunOptions, list_all_tests, run_all_tests};
use testherd_test_utils::builders::ProjectBuilder;
use testherd_test_utils::{Event, RecordingReporter, init_tracing, with_timeout};

struct Recorder {
    name: &'static str,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name,
            journal: Arc::clone(journal),
        }
    }

    fn note(&self, what: String) {
        self.journal.lock().unwrap().push(what);
    }
}

impl Plugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn setup<'a>(&'a self, _config: &'a ConfigFile) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.note(format!("setup {}", self.name));
            Ok(())
        })
    }

    fn begin<'a>(&'a self, suite: &'a Suite) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.note(format!("begin {} ({} tests)", self.name, suite.test_count()));
            Ok(())
        })
    }

    fn teardown(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.note(format!("teardown {}", self.name));
            Ok(())
        })
    }
}

fn config(run: RunSection) -> ConfigFile {
    ConfigFile::try_from(RawConfigFile {
        config: run,
        project: vec![ProjectBuilder::new("unit").test_dir("suite").build()],
        fixture: Default::default(),
    })
    .unwrap()
}

fn options(fs: MockFileSystem, reporter: &Arc<RecordingReporter>) -> RunOptions {
    RunOptions::new(reporter.clone(), Arc::new(InProcessLauncher::new()))
        .with_loader(Arc::new(TomlSuiteLoader::new(Arc::new(fs))))
}

fn suite_fs(cmd: &str) -> MockFileSystem {
    let fs = MockFileSystem::new();
    fs.add_file(
        "suite/a.test.toml",
        format!("[[test]]\ntitle = \"one\"\ncmd = \"{cmd}\"\n"),
    );
    fs
}

#[cfg(unix)]
#[tokio::test]
async fn plugins_bracket_the_run_in_reverse_order() {
    init_tracing();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let reporter = Arc::new(RecordingReporter::new());
    let opts = options(suite_fs("true"), &reporter)
        .with_plugin(Arc::new(Recorder::new("first", &journal)))
        .with_plugin(Arc::new(Recorder::new("second", &journal)));

    let outcome = with_timeout(run_all_tests(config(RunSection::default()), opts))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Passed);
    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "setup first",
            "setup second",
            "begin first (1 tests)",
            "begin second (1 tests)",
            "teardown second",
            "teardown first",
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn failing_global_setup_runs_nothing_but_still_tears_plugins_down() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let reporter = Arc::new(RecordingReporter::new());
    let opts = options(suite_fs("true"), &reporter)
        .with_plugin(Arc::new(Recorder::new("only", &journal)));
    let run = RunSection {
        global_setup: Some("echo preparing; exit 7".to_string()),
        ..RunSection::default()
    };

    let outcome = with_timeout(run_all_tests(config(run), opts)).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(*journal.lock().unwrap(), vec!["setup only", "teardown only"]);
    assert_eq!(reporter.count(|e| matches!(e, Event::TestBegin { .. })), 0);
    assert!(
        reporter
            .errors()
            .iter()
            .any(|e| e.message.contains("Global setup exited with code 7")),
        "{:?}",
        reporter.errors()
    );
    assert!(reporter.events().contains(&Event::StdOut("preparing\n".to_string())));
}

#[cfg(unix)]
#[tokio::test]
async fn global_timeout_stops_the_run_and_its_workers() {
    let reporter = Arc::new(RecordingReporter::new());
    let run = RunSection {
        global_timeout_ms: 300,
        stop_grace_ms: 100,
        timeout_ms: 0,
        ..RunSection::default()
    };

    let outcome = with_timeout(run_all_tests(config(run), options(suite_fs("sleep 30"), &reporter)))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::TimedOut);
    assert_eq!(outcome.tests.len(), 1);
    assert_eq!(outcome.tests[0].outcome(), TestOutcome::Interrupted);
    assert!(
        reporter
            .errors()
            .iter()
            .any(|e| e.message == "Timed out waiting for the test run to finish")
    );
    assert!(matches!(reporter.events().last(), Some(Event::End(RunStatus::TimedOut))));
}

#[tokio::test]
async fn listing_reports_the_suite_without_running_it() {
    let reporter = Arc::new(RecordingReporter::new());
    let outcome = with_timeout(list_all_tests(
        config(RunSection::default()),
        options(suite_fs("exit 1"), &reporter),
    ))
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Passed);
    assert_eq!(outcome.tests[0].outcome(), TestOutcome::Pending);
    assert_eq!(reporter.count(|e| matches!(e, Event::Begin { tests: 1 })), 1);
    assert_eq!(reporter.count(|e| matches!(e, Event::TestBegin { .. })), 0);
}
