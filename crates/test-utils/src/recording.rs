use std::sync::Mutex;

use testherd::config::ConfigFile;
use testherd::reporter::{FullResult, Reporter};
use testherd::results::{TestResult, TestStep};
use testherd::suite::{Suite, TestCase};
use testherd::types::{RunStatus, TestError, TestStatus};

/// One reporter call, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin { tests: usize },
    TestBegin { title: String, retry: u32 },
    TestEnd { title: String, retry: u32, status: TestStatus },
    StepBegin { title: String, step: String },
    StepEnd { title: String, step: String, failed: bool },
    StdOut(String),
    StdErr(String),
    Error(TestError),
    End(RunStatus),
}

/// Reporter that remembers every call in order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<Event>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<TestError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    /// Final status of every `on_test_end` for `title`, in order.
    pub fn statuses_of(&self, title: &str) -> Vec<TestStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::TestEnd { title: t, status, .. } if t == title => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Reporter for RecordingReporter {
    fn on_begin(&self, _config: &ConfigFile, suite: &Suite) {
        self.push(Event::Begin {
            tests: suite.test_count(),
        });
    }

    fn on_test_begin(&self, test: &TestCase, retry: u32) {
        self.push(Event::TestBegin {
            title: test.title.clone(),
            retry,
        });
    }

    fn on_test_end(&self, test: &TestCase, result: &TestResult) {
        self.push(Event::TestEnd {
            title: test.title.clone(),
            retry: result.retry,
            status: result.status,
        });
    }

    fn on_step_begin(&self, test: &TestCase, step: &TestStep) {
        self.push(Event::StepBegin {
            title: test.title.clone(),
            step: step.title.clone(),
        });
    }

    fn on_step_end(&self, test: &TestCase, step: &TestStep, error: Option<&TestError>) {
        self.push(Event::StepEnd {
            title: test.title.clone(),
            step: step.title.clone(),
            failed: error.is_some(),
        });
    }

    fn on_std_out(&self, chunk: &str, _test: Option<&TestCase>) {
        self.push(Event::StdOut(chunk.to_string()));
    }

    fn on_std_err(&self, chunk: &str, _test: Option<&TestCase>) {
        self.push(Event::StdErr(chunk.to_string()));
    }

    fn on_error(&self, error: &TestError) {
        self.push(Event::Error(error.clone()));
    }

    fn on_end(&self, result: &FullResult) {
        self.push(Event::End(result.status));
    }
}
