// tests/dispatcher.rs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use testherd::dispatch::{Dispatcher, DispatcherSettings, WORKER_CRASH_MESSAGE};
use testherd::reporter::Reporter;
use testherd::types::{TestOutcome, TestStatus};
use testherd_test_utils::builders::{TestCaseBuilder, group};
use testherd_test_utils::{Behavior, RecordingReporter, ScriptedLauncher, init_tracing, with_timeout};
use tokio_util::sync::CancellationToken;

fn dispatcher(
    workers: usize,
    launcher: &ScriptedLauncher,
    reporter: &Arc<RecordingReporter>,
    interrupt: CancellationToken,
) -> Dispatcher {
    let mut settings = DispatcherSettings::new(workers);
    settings.stop_grace = Duration::from_millis(50);
    Dispatcher::new(
        settings,
        Arc::new(launcher.clone()),
        Arc::clone(reporter) as Arc<dyn Reporter>,
        interrupt,
    )
}

#[tokio::test]
async fn failing_then_passing_test_is_flaky_and_retried_on_fresh_workers() {
    init_tracing();
    let launcher = ScriptedLauncher::new().with("flaky", Behavior::FailTimes(2));
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(2, &launcher, &reporter, CancellationToken::new());

    let flaky = TestCaseBuilder::new("p", "flaky").retries(2).build();
    with_timeout(d.run(vec![group("p", "p|", vec![Arc::clone(&flaky)])])).await;
    with_timeout(d.stop()).await;

    let record = d.records().get(&flaky.id).unwrap();
    assert_eq!(record.attempts(), 3);
    assert_eq!(record.outcome(), TestOutcome::Flaky);
    assert_eq!(
        reporter.statuses_of("flaky"),
        vec![TestStatus::Failed, TestStatus::Failed, TestStatus::Passed]
    );

    let workers: HashSet<usize> = launcher
        .executed()
        .iter()
        .filter(|e| e.title == "flaky")
        .map(|e| e.worker_index)
        .collect();
    assert_eq!(workers.len(), 3, "each retry must land in a fresh worker");
    assert!(!d.has_worker_errors());
}

#[tokio::test]
async fn retries_are_exhausted_then_the_test_fails() {
    let launcher = ScriptedLauncher::new().with("broken", Behavior::Fail);
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let broken = TestCaseBuilder::new("p", "broken").retries(1).build();
    with_timeout(d.run(vec![group("p", "p|", vec![Arc::clone(&broken)])])).await;
    with_timeout(d.stop()).await;

    let record = d.records().get(&broken.id).unwrap();
    assert_eq!(record.attempts(), 2);
    assert_eq!(record.outcome(), TestOutcome::Failed);
    assert_eq!(
        record.results.iter().map(|r| r.retry).collect::<Vec<_>>(),
        vec![0, 1]
    );
}

#[tokio::test]
async fn timed_out_worker_is_not_reused_and_rest_of_group_runs_elsewhere() {
    init_tracing();
    let launcher = ScriptedLauncher::new().with("slow", Behavior::Hang);
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let slow = TestCaseBuilder::new("p", "slow").timeout_ms(50).build();
    let after = TestCaseBuilder::new("p", "after").ordinal(1).build();
    with_timeout(d.run(vec![group(
        "p",
        "p|",
        vec![Arc::clone(&slow), Arc::clone(&after)],
    )]))
    .await;
    with_timeout(d.stop()).await;

    let slow_record = d.records().get(&slow.id).unwrap();
    assert_eq!(slow_record.outcome(), TestOutcome::TimedOut);
    let error = slow_record.results[0].error.as_ref().unwrap();
    assert!(error.message.contains("Test timeout of 50ms exceeded"), "{error}");

    let after_record = d.records().get(&after.id).unwrap();
    assert_eq!(after_record.outcome(), TestOutcome::Passed);
    assert_eq!(after_record.attempts(), 1, "re-queueing does not use an attempt");

    assert_eq!(launcher.launches(), 2);
    let executed = launcher.executed();
    let slow_worker = executed.iter().find(|e| e.title == "slow").unwrap().worker_index;
    let after_worker = executed.iter().find(|e| e.title == "after").unwrap().worker_index;
    assert_ne!(slow_worker, after_worker);
}

#[tokio::test]
async fn crash_fails_running_test_and_group_without_retries() {
    let launcher = ScriptedLauncher::new().with("boom", Behavior::Crash);
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let boom = TestCaseBuilder::new("p", "boom").build();
    let next = TestCaseBuilder::new("p", "next").ordinal(1).build();
    with_timeout(d.run(vec![group(
        "p",
        "p|",
        vec![Arc::clone(&boom), Arc::clone(&next)],
    )]))
    .await;
    with_timeout(d.stop()).await;

    assert!(d.has_worker_errors());
    for test in [&boom, &next] {
        let record = d.records().get(&test.id).unwrap();
        assert_eq!(record.outcome(), TestOutcome::Failed);
        let error = record.results[0].error.as_ref().unwrap();
        assert_eq!(error.message, WORKER_CRASH_MESSAGE);
    }
}

#[tokio::test]
async fn crashing_test_gets_one_more_attempt_and_siblings_are_requeued() {
    let launcher = ScriptedLauncher::new().with("boom", Behavior::Crash);
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let boom = TestCaseBuilder::new("p", "boom").retries(5).build();
    let next = TestCaseBuilder::new("p", "next").ordinal(1).retries(1).build();
    with_timeout(d.run(vec![group(
        "p",
        "p|",
        vec![Arc::clone(&boom), Arc::clone(&next)],
    )]))
    .await;
    with_timeout(d.stop()).await;

    let boom_record = d.records().get(&boom.id).unwrap();
    assert_eq!(boom_record.attempts(), 2);
    assert_eq!(boom_record.outcome(), TestOutcome::Failed);

    let next_record = d.records().get(&next.id).unwrap();
    assert_eq!(next_record.outcome(), TestOutcome::Passed);
    assert_eq!(next_record.attempts(), 1);
}

#[tokio::test]
async fn interrupt_stops_assignment_and_run_still_resolves() {
    init_tracing();
    let launcher = ScriptedLauncher::new().with("hang", Behavior::Hang);
    let reporter = Arc::new(RecordingReporter::new());
    let interrupt = CancellationToken::new();
    let mut d = dispatcher(1, &launcher, &reporter, interrupt.clone());

    let hang = TestCaseBuilder::new("p", "hang").build();
    let queued = TestCaseBuilder::new("p", "queued").file("b.test.toml").build();

    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    with_timeout(d.run(vec![
        group("p", "p|", vec![Arc::clone(&hang)]),
        group("p", "p|", vec![Arc::clone(&queued)]),
    ]))
    .await;
    with_timeout(d.stop()).await;

    assert_eq!(d.records().get(&hang.id).unwrap().outcome(), TestOutcome::Interrupted);
    assert_eq!(d.records().get(&queued.id).unwrap().outcome(), TestOutcome::Interrupted);
    assert_eq!(launcher.launches(), 1);
    assert!(launcher.executed().iter().all(|e| e.title != "queued"));
}

#[tokio::test]
async fn idle_worker_with_the_same_hash_is_reused() {
    let launcher = ScriptedLauncher::new();
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let a = TestCaseBuilder::new("p", "a").build();
    let b = TestCaseBuilder::new("p", "b").file("b.test.toml").build();
    let c = TestCaseBuilder::new("p", "c").file("c.test.toml").build();
    with_timeout(d.run(vec![
        group("p", "p|", vec![a]),
        group("p", "p|", vec![b]),
        group("p", "p|db", vec![c]),
    ]))
    .await;
    with_timeout(d.stop()).await;

    // Two hashes on a pool of one: the first worker serves both `p|` groups,
    // then is retired to make room for `p|db`.
    assert_eq!(launcher.launches(), 2);
    assert!(d.records().iter().all(|r| r.outcome() == TestOutcome::Passed));
}

#[tokio::test]
async fn launch_failure_is_a_worker_error() {
    let launcher = ScriptedLauncher::new().failing_launch();
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let a = TestCaseBuilder::new("p", "a").build();
    with_timeout(d.run(vec![group("p", "p|", vec![Arc::clone(&a)])])).await;
    with_timeout(d.stop()).await;

    assert!(d.has_worker_errors());
    let record = d.records().get(&a.id).unwrap();
    assert_eq!(record.outcome(), TestOutcome::Failed);
    assert!(
        record.results[0]
            .error
            .as_ref()
            .unwrap()
            .message
            .starts_with("Failed to launch worker")
    );
}

#[tokio::test]
async fn worker_teardown_errors_are_collected_not_reported() {
    let launcher = ScriptedLauncher::new().with_teardown_error("fixture 'db' teardown exited with code 1");
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let a = TestCaseBuilder::new("p", "a").build();
    with_timeout(d.run(vec![group("p", "p|", vec![a])])).await;
    with_timeout(d.stop()).await;

    let fatal = d.take_fatal_errors();
    assert_eq!(fatal.len(), 1);
    assert!(fatal[0].message.contains("teardown"));
    assert!(reporter.errors().is_empty());
    assert!(d.take_fatal_errors().is_empty());
}

#[tokio::test]
async fn timed_out_attempt_is_retried_on_a_fresh_worker() {
    let launcher = ScriptedLauncher::new().with("stuck", Behavior::Hang);
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let stuck = TestCaseBuilder::new("p", "stuck")
        .timeout_ms(50)
        .retries(1)
        .build();
    with_timeout(d.run(vec![group("p", "p|", vec![Arc::clone(&stuck)])])).await;
    with_timeout(d.stop()).await;

    let record = d.records().get(&stuck.id).unwrap();
    assert_eq!(record.attempts(), 2);
    assert_eq!(record.outcome(), TestOutcome::TimedOut);
    assert_eq!(
        reporter.statuses_of("stuck"),
        vec![TestStatus::TimedOut, TestStatus::TimedOut]
    );

    let workers: HashSet<usize> = launcher
        .executed()
        .iter()
        .filter(|e| e.title == "stuck")
        .map(|e| e.worker_index)
        .collect();
    assert_eq!(workers.len(), 2);
}

#[tokio::test]
async fn test_failing_because_of_the_interrupt_ends_interrupted() {
    let launcher = ScriptedLauncher::new().with("victim", Behavior::FailOnStop);
    let reporter = Arc::new(RecordingReporter::new());
    let interrupt = CancellationToken::new();
    let mut d = dispatcher(1, &launcher, &reporter, interrupt.clone());

    let victim = TestCaseBuilder::new("p", "victim").retries(2).build();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    with_timeout(d.run(vec![group("p", "p|", vec![Arc::clone(&victim)])])).await;
    with_timeout(d.stop()).await;

    let record = d.records().get(&victim.id).unwrap();
    assert_eq!(record.attempts(), 1);
    assert_eq!(record.outcome(), TestOutcome::Interrupted);
    assert_eq!(reporter.statuses_of("victim"), vec![TestStatus::Interrupted]);
}

#[tokio::test]
async fn full_pool_waits_for_a_retired_worker_before_launching() {
    let launcher = ScriptedLauncher::new().with_stop_delay(Duration::from_millis(100));
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let a = TestCaseBuilder::new("p", "a").build();
    let b = TestCaseBuilder::new("p", "b").file("b.test.toml").build();
    with_timeout(d.run(vec![
        group("p", "p|", vec![a]),
        group("p", "p|db", vec![b]),
    ]))
    .await;
    with_timeout(d.stop()).await;

    assert_eq!(launcher.launches(), 2);
    assert_eq!(launcher.peak_live(), 1);
    assert!(d.records().iter().all(|r| r.outcome() == TestOutcome::Passed));
}

#[tokio::test]
async fn stop_retires_workers_handed_back_by_an_abandoned_run() {
    let launcher = ScriptedLauncher::new()
        .with("slow", Behavior::PassAfter(Duration::from_millis(100)))
        .with_teardown_error("fixture 'db' teardown exited with code 1");
    let reporter = Arc::new(RecordingReporter::new());
    let mut d = dispatcher(1, &launcher, &reporter, CancellationToken::new());

    let slow = TestCaseBuilder::new("p", "slow").build();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        d.run(vec![group("p", "p|", vec![Arc::clone(&slow)])]),
    )
    .await;
    assert!(abandoned.is_err());
    with_timeout(d.stop()).await;

    assert_eq!(d.records().get(&slow.id).unwrap().outcome(), TestOutcome::Passed);
    assert_eq!(d.take_fatal_errors().len(), 1);
}
