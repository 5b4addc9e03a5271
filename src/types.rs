use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical project name type used throughout the crate.
pub type ProjectName = String;

/// Stable identifier of a single test case.
///
/// Built from the project, the file path relative to the project's test
/// directory and the test's ordinal within that file, so two tests with the
/// same title never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub String);

impl TestId {
    pub fn new(project: &str, file: &str, ordinal: usize) -> Self {
        TestId(format!("{project}::{file}::{ordinal}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a test, and the status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Pending,
    Running,
    Passed,
    Failed,
    TimedOut,
    Skipped,
    Interrupted,
}

impl TestStatus {
    /// Whether an attempt with this status is eligible for another attempt.
    pub fn is_retriable(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::TimedOut)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::TimedOut => "timedOut",
            TestStatus::Skipped => "skipped",
            TestStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Final verdict for a test after all of its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TestOutcome {
    Passed,
    Flaky,
    Failed,
    TimedOut,
    Skipped,
    Interrupted,
    /// No attempt finished (only visible while a run is still in progress).
    Pending,
}

impl TestOutcome {
    /// `true` for outcomes that do not make their project unsuccessful.
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            TestOutcome::Passed | TestOutcome::Flaky | TestOutcome::Skipped
        )
    }
}

/// Overall status of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Passed,
    Failed,
    TimedOut,
    Interrupted,
}

impl RunStatus {
    /// Process exit code derived from the run status.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Passed => 0,
            RunStatus::Failed | RunStatus::TimedOut => 1,
            RunStatus::Interrupted => 130,
        }
    }
}

/// An error attached to a test result, a step, or reported on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(details) = &self.details {
            write!(f, "\n{details}")?;
        }
        Ok(())
    }
}

/// How a project's tests are split into groups.
///
/// - `Default`: all tests of a file sharing a worker hash form one group.
/// - `Parallel`: such a bucket is further split so several workers can
///   share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    Default,
    Parallel,
}

impl Default for GroupMode {
    fn default() -> Self {
        GroupMode::Default
    }
}

/// Lifetime of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    /// Set up before and torn down after every test that uses it.
    Test,
    /// Set up once per worker process, torn down when the worker stops.
    Worker,
}

impl Default for FixtureScope {
    fn default() -> Self {
        FixtureScope::Test
    }
}
