// src/reporter/internal.rs

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::ConfigFile;
use crate::results::{TestResult, TestStep};
use crate::suite::{Suite, TestCase};
use crate::types::TestError;

use super::{FullResult, Reporter};

#[derive(Debug, Default)]
struct State {
    began: bool,
    ended: bool,
    /// Errors reported before `on_begin`, flushed right after it.
    pending_errors: Vec<TestError>,
}

/// Wraps the user-facing reporter and enforces the begin/end contract:
///
/// - `on_begin` and `on_end` reach the inner reporter at most once each;
/// - ending without a begin first emits a begin with an empty suite;
/// - errors reported before begin are buffered and flushed after it.
pub struct InternalReporter {
    inner: Arc<dyn Reporter>,
    config: ConfigFile,
    state: Mutex<State>,
}

impl InternalReporter {
    pub fn new(inner: Arc<dyn Reporter>, config: ConfigFile) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn has_begun(&self) -> bool {
        self.lock().began
    }

    pub fn has_ended(&self) -> bool {
        self.lock().ended
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking reporter hook must not wedge the rest of the run.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, suite: &Suite) {
        let pending = {
            let mut state = self.lock();
            if state.began {
                return;
            }
            state.began = true;
            std::mem::take(&mut state.pending_errors)
        };
        self.inner.on_begin(&self.config, suite);
        for error in pending.iter() {
            self.inner.on_error(error);
        }
    }
}

impl Reporter for InternalReporter {
    fn on_begin(&self, _config: &ConfigFile, suite: &Suite) {
        self.begin(suite);
    }

    fn on_test_begin(&self, test: &TestCase, retry: u32) {
        self.inner.on_test_begin(test, retry);
    }

    fn on_test_end(&self, test: &TestCase, result: &TestResult) {
        self.inner.on_test_end(test, result);
    }

    fn on_step_begin(&self, test: &TestCase, step: &TestStep) {
        self.inner.on_step_begin(test, step);
    }

    fn on_step_end(&self, test: &TestCase, step: &TestStep, error: Option<&TestError>) {
        self.inner.on_step_end(test, step, error);
    }

    fn on_std_out(&self, chunk: &str, test: Option<&TestCase>) {
        self.inner.on_std_out(chunk, test);
    }

    fn on_std_err(&self, chunk: &str, test: Option<&TestCase>) {
        self.inner.on_std_err(chunk, test);
    }

    fn on_error(&self, error: &TestError) {
        {
            let mut state = self.lock();
            if !state.began {
                debug!(error = %error.message, "buffering error reported before begin");
                state.pending_errors.push(error.clone());
                return;
            }
        }
        self.inner.on_error(error);
    }

    fn on_end(&self, result: &FullResult) {
        self.begin(&Suite::default());
        {
            let mut state = self.lock();
            if state.ended {
                return;
            }
            state.ended = true;
        }
        self.inner.on_end(result);
    }
}
