// src/reporter/line.rs

//! Plain-text reporter: one line per finished test, a summary at the end.
//!
//! Test output is passed through verbatim so it interleaves with the result
//! lines in the order it was produced.

use std::io::Write;
use std::sync::Mutex;

use crate::config::ConfigFile;
use crate::results::TestResult;
use crate::suite::{Suite, TestCase};
use crate::types::{TestError, TestStatus};

use super::{FullResult, Reporter};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub interrupted: usize,
    pub retried: usize,
}

pub struct LineReporter {
    out: Mutex<Box<dyn Write + Send>>,
    tally: Mutex<Tally>,
    /// Print the suite on begin and nothing at the end.
    listing: bool,
}

impl Default for LineReporter {
    fn default() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl LineReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            tally: Mutex::new(Tally::default()),
            listing: false,
        }
    }

    /// Reporter for `testherd list`.
    pub fn listing(out: Box<dyn Write + Send>) -> Self {
        Self {
            listing: true,
            ..Self::new(out)
        }
    }

    pub fn tally(&self) -> Tally {
        *self.tally.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        // Reporting must never abort a run; a closed stdout just loses output.
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

fn status_mark(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "✓",
        TestStatus::Failed => "✘",
        TestStatus::TimedOut => "⏱",
        TestStatus::Skipped => "-",
        TestStatus::Interrupted => "!",
        TestStatus::Pending | TestStatus::Running => "?",
    }
}

impl Reporter for LineReporter {
    fn on_begin(&self, config: &ConfigFile, suite: &Suite) {
        if self.listing {
            let mut text = String::from("Listing tests:\n");
            for test in suite.all_tests() {
                text.push_str(&format!("  {}\n", test.full_title()));
            }
            let files: usize = suite.projects.iter().map(|p| p.files.len()).sum();
            text.push_str(&format!("Total: {} tests in {} files\n", suite.test_count(), files));
            self.write(&text);
            return;
        }
        self.write(&format!(
            "Running {} tests in {} projects using up to {} workers\n\n",
            suite.test_count(),
            suite.projects.len(),
            config.config.workers
        ));
    }

    fn on_test_end(&self, test: &TestCase, result: &TestResult) {
        {
            let mut tally = self.tally.lock().unwrap_or_else(|p| p.into_inner());
            let last_attempt = !result.status.is_retriable() || result.retry + 1 >= test.max_attempts();
            match result.status {
                TestStatus::Passed => tally.passed += 1,
                TestStatus::Skipped => tally.skipped += 1,
                TestStatus::Interrupted => tally.interrupted += 1,
                TestStatus::Failed | TestStatus::TimedOut if !last_attempt => tally.retried += 1,
                TestStatus::Failed => tally.failed += 1,
                TestStatus::TimedOut => tally.timed_out += 1,
                TestStatus::Pending | TestStatus::Running => {}
            }
        }

        let retry = if result.retry > 0 {
            format!(" (retry #{})", result.retry)
        } else {
            String::new()
        };
        let mut line = format!(
            "  {} {}{} ({}ms)\n",
            status_mark(result.status),
            test.full_title(),
            retry,
            result.duration.as_millis()
        );
        if let Some(error) = &result.error {
            for l in error.to_string().lines() {
                line.push_str(&format!("      {l}\n"));
            }
        }
        self.write(&line);
    }

    fn on_std_out(&self, chunk: &str, _test: Option<&TestCase>) {
        self.write(chunk);
    }

    fn on_error(&self, error: &TestError) {
        let mut text = format!("Error: {}\n", error.message);
        if let Some(details) = &error.details {
            for l in details.lines() {
                text.push_str(&format!("  {l}\n"));
            }
        }
        self.write(&text);
    }

    fn on_end(&self, result: &FullResult) {
        if self.listing {
            return;
        }
        let t = self.tally();
        let mut parts = vec![format!("{} passed", t.passed)];
        for (count, label) in [
            (t.failed, "failed"),
            (t.timed_out, "timed out"),
            (t.retried, "retried"),
            (t.skipped, "skipped"),
            (t.interrupted, "interrupted"),
        ] {
            if count > 0 {
                parts.push(format!("{count} {label}"));
            }
        }
        self.write(&format!(
            "\n{} ({:?}, {}ms)\n",
            parts.join(", "),
            result.status,
            result.duration.as_millis()
        ));
    }
}
