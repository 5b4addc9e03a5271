// src/reporter/mod.rs

//! Progress observers.
//!
//! Every hook of [`Reporter`] has a no-op default, so a reporter only
//! implements what it cares about. Hooks take `&self`: reporters are shared
//! between the pipeline and the dispatchers and synchronise internally.
//!
//! - [`Multiplexer`] fans every hook out to several reporters.
//! - [`internal::InternalReporter`] wraps the user-facing reporter and
//!   guarantees `on_begin` / `on_end` happen exactly once.
//! - [`line::LineReporter`] prints one line per finished test.

pub mod internal;
pub mod line;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigFile;
use crate::results::{TestResult, TestStep};
use crate::suite::{Suite, TestCase};
use crate::types::{RunStatus, TestError};

pub use internal::InternalReporter;
pub use line::LineReporter;

/// Summary handed to [`Reporter::on_end`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullResult {
    pub status: RunStatus,
    pub duration: Duration,
}

pub trait Reporter: Send + Sync {
    fn on_begin(&self, _config: &ConfigFile, _suite: &Suite) {}

    /// `retry` is the zero-based attempt index.
    fn on_test_begin(&self, _test: &TestCase, _retry: u32) {}

    fn on_test_end(&self, _test: &TestCase, _result: &TestResult) {}

    fn on_step_begin(&self, _test: &TestCase, _step: &TestStep) {}

    fn on_step_end(&self, _test: &TestCase, _step: &TestStep, _error: Option<&TestError>) {}

    fn on_std_out(&self, _chunk: &str, _test: Option<&TestCase>) {}

    fn on_std_err(&self, _chunk: &str, _test: Option<&TestCase>) {}

    /// An error not attached to a single test result.
    fn on_error(&self, _error: &TestError) {}

    fn on_end(&self, _result: &FullResult) {}
}

/// Forwards every hook to each inner reporter in registration order.
#[derive(Default)]
pub struct Multiplexer {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Multiplexer {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for Multiplexer {
    fn on_begin(&self, config: &ConfigFile, suite: &Suite) {
        self.reporters.iter().for_each(|r| r.on_begin(config, suite));
    }

    fn on_test_begin(&self, test: &TestCase, retry: u32) {
        self.reporters.iter().for_each(|r| r.on_test_begin(test, retry));
    }

    fn on_test_end(&self, test: &TestCase, result: &TestResult) {
        self.reporters.iter().for_each(|r| r.on_test_end(test, result));
    }

    fn on_step_begin(&self, test: &TestCase, step: &TestStep) {
        self.reporters.iter().for_each(|r| r.on_step_begin(test, step));
    }

    fn on_step_end(&self, test: &TestCase, step: &TestStep, error: Option<&TestError>) {
        self.reporters
            .iter()
            .for_each(|r| r.on_step_end(test, step, error));
    }

    fn on_std_out(&self, chunk: &str, test: Option<&TestCase>) {
        self.reporters.iter().for_each(|r| r.on_std_out(chunk, test));
    }

    fn on_std_err(&self, chunk: &str, test: Option<&TestCase>) {
        self.reporters.iter().for_each(|r| r.on_std_err(chunk, test));
    }

    fn on_error(&self, error: &TestError) {
        self.reporters.iter().for_each(|r| r.on_error(error));
    }

    fn on_end(&self, result: &FullResult) {
        self.reporters.iter().for_each(|r| r.on_end(result));
    }
}

/// Reporter that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}
