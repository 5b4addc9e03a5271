// src/worker/fixtures.rs

//! Worker-scoped fixture bookkeeping.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{FixtureSpec, WorkerMessage};
use crate::types::TestError;

use super::command::{CommandContext, run_shell};

/// Worker-scoped fixtures that have been set up, in setup order.
#[derive(Debug, Default)]
pub struct WorkerFixtures {
    active: Vec<(String, FixtureSpec)>,
}

impl WorkerFixtures {
    pub fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|(n, _)| n == name)
    }

    pub fn activate(&mut self, name: &str, spec: &FixtureSpec) {
        if !self.is_active(name) {
            self.active.push((name.to_string(), spec.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Tear every active fixture down, last set up first.
    ///
    /// A failing teardown does not prevent the remaining ones from running.
    pub async fn teardown_all(
        &mut self,
        env: &[(&'static str, String)],
        out: &mpsc::UnboundedSender<WorkerMessage>,
    ) -> Vec<TestError> {
        let mut errors = Vec::new();
        while let Some((name, spec)) = self.active.pop() {
            let Some(cmd) = spec.teardown.as_deref() else {
                continue;
            };
            debug!(fixture = %name, "tearing down worker fixture");
            let ctx = CommandContext { test_id: None, env };
            let error = match run_shell(cmd, ctx, out).await {
                Ok(outcome) => outcome.error(&format!("Worker fixture '{name}' teardown")),
                Err(err) => Some(TestError::new(format!(
                    "Worker fixture '{name}' teardown could not run: {err:#}"
                ))),
            };
            if let Some(error) = error {
                warn!(fixture = %name, error = %error.message, "worker fixture teardown failed");
                errors.push(error);
            }
        }
        errors
    }
}
