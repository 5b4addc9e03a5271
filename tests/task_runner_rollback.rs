// tests/task_runner_rollback.rs

use std::time::Duration;

use testherd::tasks::{BoxFuture, RunLimits, Task, TaskRunner, TaskRunnerStatus, Teardown};
use testherd_test_utils::{init_tracing, with_timeout};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Journal {
    entries: Vec<String>,
}

enum Body {
    Ok,
    Fail,
    Hang,
}

struct Step {
    name: &'static str,
    body: Body,
    teardown_fails: bool,
}

struct Undo {
    name: &'static str,
    fails: bool,
}

impl Teardown<Journal> for Undo {
    fn teardown<'a>(self: Box<Self>, ctx: &'a mut Journal) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.entries.push(format!("undo {}", self.name));
            if self.fails {
                anyhow::bail!("could not undo {}", self.name);
            }
            Ok(())
        })
    }
}

impl Task<Journal> for Step {
    fn run<'a>(
        &'a self,
        ctx: &'a mut Journal,
    ) -> BoxFuture<'a, anyhow::Result<Option<Box<dyn Teardown<Journal>>>>> {
        Box::pin(async move {
            ctx.entries.push(format!("do {}", self.name));
            match self.body {
                Body::Ok => {}
                Body::Fail => anyhow::bail!("{} exploded", self.name),
                Body::Hang => std::future::pending::<()>().await,
            }
            Ok(Some(Box::new(Undo {
                name: self.name,
                fails: self.teardown_fails,
            }) as Box<dyn Teardown<Journal>>))
        })
    }
}

fn step(name: &'static str, body: Body) -> Step {
    Step {
        name,
        body,
        teardown_fails: false,
    }
}

#[tokio::test]
async fn failing_third_step_unwinds_first_two_once_in_reverse() {
    init_tracing();
    let mut runner = TaskRunner::new();
    runner.add_task("one", step("one", Body::Ok));
    runner.add_task(
        "two",
        Step {
            teardown_fails: true,
            ..step("two", Body::Ok)
        },
    );
    runner.add_task("three", step("three", Body::Fail));
    runner.add_task("four", step("four", Body::Ok));
    runner.add_task("five", step("five", Body::Ok));

    let mut journal = Journal::default();
    let report = runner.run(&mut journal, RunLimits::default()).await;

    assert_eq!(report.status, TaskRunnerStatus::Failed);
    assert_eq!(report.failure.as_ref().map(|f| f.task.as_str()), Some("three"));
    assert_eq!(report.rolled_back, vec!["two", "one"]);
    assert_eq!(report.teardown_failures.len(), 1);
    assert_eq!(report.teardown_failures[0].task, "two");
    assert_eq!(
        journal.entries,
        vec!["do one", "do two", "do three", "undo two", "undo one"]
    );
}

#[tokio::test]
async fn global_timeout_abandons_the_running_step() {
    init_tracing();
    let mut runner = TaskRunner::new();
    runner.add_task("setup", step("setup", Body::Ok));
    runner.add_task("forever", step("forever", Body::Hang));
    runner.add_task("never", step("never", Body::Ok));

    let mut journal = Journal::default();
    let limits = RunLimits {
        global_timeout: Some(Duration::from_millis(50)),
        ..RunLimits::default()
    };
    let report = with_timeout(runner.run(&mut journal, limits)).await;

    assert_eq!(report.status, TaskRunnerStatus::TimedOut);
    assert!(report.failure.is_none());
    assert_eq!(journal.entries, vec!["do setup", "do forever", "undo setup"]);
}

#[tokio::test]
async fn interrupt_during_a_step_waits_for_the_grace_period() {
    init_tracing();
    let mut runner = TaskRunner::new();
    runner.add_task("setup", step("setup", Body::Ok));
    runner.add_task("forever", step("forever", Body::Hang));

    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let mut journal = Journal::default();
    let limits = RunLimits {
        interrupt,
        interrupt_grace: Duration::from_millis(20),
        ..RunLimits::default()
    };
    let report = with_timeout(runner.run(&mut journal, limits)).await;

    assert_eq!(report.status, TaskRunnerStatus::Interrupted);
    assert_eq!(report.rolled_back, vec!["setup"]);
}

#[tokio::test]
async fn successful_pipeline_still_releases_everything() {
    let mut runner = TaskRunner::new();
    runner.add_task("a", step("a", Body::Ok));
    runner.add_task("b", step("b", Body::Ok));

    let mut journal = Journal::default();
    let report = runner.run(&mut journal, RunLimits::default()).await;

    assert_eq!(report.status, TaskRunnerStatus::Completed);
    assert_eq!(report.rolled_back, vec!["b", "a"]);
}
