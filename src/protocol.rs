// src/protocol.rs

//! Messages exchanged between the dispatcher and a worker.
//!
//! The host drives the worker with [`HostMessage`]s; the worker answers with a
//! stream of [`WorkerMessage`]s. Over a process boundary each message is one
//! line of JSON (see [`encode_line`] / [`decode_line`]); in-memory transports
//! pass the values directly.
//!
//! A worker receives exactly one `Init` before its first `Run`. After each
//! `Run` it emits, per test, `TestBegin`, any number of step and output
//! messages, then `TestEnd`, and finally one `GroupDone`. `Stop` asks the
//! worker to abandon whatever it is doing, tear down worker fixtures, reply
//! `Stopped` and exit.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::FixtureConfig;
use crate::types::{ProjectName, TestError, TestId, TestStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Init(WorkerInit),
    Run(RunGroup),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInit {
    pub worker_index: usize,
    pub project: ProjectName,
    pub worker_hash: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Fixture definitions by name; the worker uses the ones its tests ask for.
    #[serde(default)]
    pub fixtures: BTreeMap<String, FixtureSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureSpec {
    pub worker_scoped: bool,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub teardown: Option<String>,
}

impl From<&FixtureConfig> for FixtureSpec {
    fn from(cfg: &FixtureConfig) -> Self {
        Self {
            worker_scoped: cfg.scope == crate::types::FixtureScope::Worker,
            setup: cfg.setup.clone(),
            teardown: cfg.teardown.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunGroup {
    pub job_id: u64,
    pub tests: Vec<TestPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPayload {
    pub test_id: TestId,
    pub title: String,
    pub cmd: String,
    /// Zero-based retry index of this attempt.
    pub attempt: u32,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    TestBegin { test_id: TestId, attempt: u32 },
    #[serde(rename_all = "camelCase")]
    StepBegin {
        test_id: TestId,
        step_id: u32,
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    StepEnd {
        test_id: TestId,
        step_id: u32,
        #[serde(default)]
        error: Option<TestError>,
    },
    #[serde(rename_all = "camelCase")]
    Stdout {
        #[serde(default)]
        test_id: Option<TestId>,
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    Stderr {
        #[serde(default)]
        test_id: Option<TestId>,
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    TestEnd {
        test_id: TestId,
        status: TestStatus,
        duration_ms: u64,
        #[serde(default)]
        error: Option<TestError>,
    },
    #[serde(rename_all = "camelCase")]
    GroupDone { job_id: u64 },
    #[serde(rename_all = "camelCase")]
    Stopped {
        #[serde(default)]
        teardown_errors: Vec<TestError>,
    },
    /// An error that belongs to no test, e.g. an undecodable host message.
    FatalError { error: TestError },
}

/// Serialize a message as a single JSON line (including the trailing `\n`).
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
