// src/results.rs

//! Per-test result bookkeeping.
//!
//! A [`TestRecord`] collects one [`TestResult`] per attempt; the final
//! [`TestOutcome`] is derived from them. [`TestRecords`] keeps records in the
//! order tests were first seen so reports come out stable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::suite::TestCase;
use crate::types::{TestError, TestId, TestOutcome, TestStatus};

/// Result of one attempt of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub status: TestStatus,
    /// Zero-based attempt index.
    pub retry: u32,
    pub duration: Duration,
    pub error: Option<TestError>,
    /// Worker that ran the attempt; `None` if it never reached a worker.
    pub worker_index: Option<usize>,
}

impl TestResult {
    pub fn new(status: TestStatus, retry: u32) -> Self {
        Self {
            status,
            retry,
            duration: Duration::ZERO,
            error: None,
            worker_index: None,
        }
    }

    pub fn with_error(mut self, error: TestError) -> Self {
        self.error = Some(error);
        self
    }
}

/// A fixture or other step reported by a worker while a test runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStep {
    pub id: u32,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct TestRecord {
    pub test: Arc<TestCase>,
    pub status: TestStatus,
    pub results: Vec<TestResult>,
    /// Lowered after a worker crash so the test gets at most one more try.
    attempt_cap: Option<u32>,
}

impl TestRecord {
    pub fn new(test: Arc<TestCase>) -> Self {
        Self {
            test,
            status: TestStatus::Pending,
            results: Vec::new(),
            attempt_cap: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.results.len() as u32
    }

    /// Attempt index the next run of this test gets.
    pub fn next_retry(&self) -> u32 {
        self.attempts()
    }

    pub fn max_attempts(&self) -> u32 {
        let budget = self.test.max_attempts();
        self.attempt_cap.map_or(budget, |cap| cap.min(budget))
    }

    pub fn can_retry(&self) -> bool {
        self.attempts() < self.max_attempts()
    }

    pub fn push(&mut self, result: TestResult) {
        self.status = result.status;
        self.results.push(result);
    }

    /// Allow at most one more attempt after the current ones.
    pub fn cap_after_crash(&mut self) {
        let cap = self.attempts() + 1;
        self.attempt_cap = Some(self.attempt_cap.map_or(cap, |c| c.min(cap)));
    }

    pub fn outcome(&self) -> TestOutcome {
        let Some(last) = self.results.last() else {
            return TestOutcome::Pending;
        };
        match last.status {
            TestStatus::Passed if self.results.iter().any(|r| r.status.is_retriable()) => {
                TestOutcome::Flaky
            }
            TestStatus::Passed => TestOutcome::Passed,
            TestStatus::Failed => TestOutcome::Failed,
            TestStatus::TimedOut => TestOutcome::TimedOut,
            TestStatus::Skipped => TestOutcome::Skipped,
            TestStatus::Interrupted => TestOutcome::Interrupted,
            TestStatus::Pending | TestStatus::Running => TestOutcome::Pending,
        }
    }
}

/// Insertion-ordered map of test records.
#[derive(Debug, Clone, Default)]
pub struct TestRecords {
    order: Vec<TestId>,
    by_id: HashMap<TestId, TestRecord>,
}

impl TestRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `test`, created on first use.
    pub fn entry(&mut self, test: &Arc<TestCase>) -> &mut TestRecord {
        if !self.by_id.contains_key(&test.id) {
            self.order.push(test.id.clone());
        }
        self.by_id
            .entry(test.id.clone())
            .or_insert_with(|| TestRecord::new(Arc::clone(test)))
    }

    pub fn get(&self, id: &TestId) -> Option<&TestRecord> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &TestId) -> Option<&mut TestRecord> {
        self.by_id.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestRecord> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Move every record of `other` into `self`; later records replace
    /// earlier ones with the same id.
    pub fn merge(&mut self, other: TestRecords) {
        let TestRecords { order, mut by_id } = other;
        for id in order {
            if let Some(record) = by_id.remove(&id) {
                if !self.by_id.contains_key(&id) {
                    self.order.push(id.clone());
                }
                self.by_id.insert(id, record);
            }
        }
    }

    pub fn into_vec(self) -> Vec<TestRecord> {
        let TestRecords { order, mut by_id } = self;
        order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn case(retries: u32) -> Arc<TestCase> {
        Arc::new(TestCase {
            id: TestId::new("p", "f", 0),
            title: "t".to_string(),
            project: "p".to_string(),
            file: PathBuf::from("f"),
            cmd: "true".to_string(),
            fixtures: Vec::new(),
            skip: false,
            retries,
            timeout: None,
        })
    }

    #[test]
    fn pass_after_failure_is_flaky() {
        let mut record = TestRecord::new(case(2));
        record.push(TestResult::new(TestStatus::Failed, 0));
        assert!(record.can_retry());
        record.push(TestResult::new(TestStatus::Passed, 1));
        assert_eq!(record.outcome(), TestOutcome::Flaky);
    }

    #[test]
    fn crash_caps_remaining_attempts_to_one() {
        let mut record = TestRecord::new(case(5));
        record.push(TestResult::new(TestStatus::Failed, 0));
        record.cap_after_crash();
        assert_eq!(record.max_attempts(), 2);
        record.push(TestResult::new(TestStatus::Failed, 1));
        assert!(!record.can_retry());
    }

    #[test]
    fn crash_cap_never_exceeds_budget() {
        let mut record = TestRecord::new(case(0));
        record.push(TestResult::new(TestStatus::Failed, 0));
        record.cap_after_crash();
        assert!(!record.can_retry());
    }

    #[test]
    fn records_keep_first_seen_order() {
        let a = case(0);
        let b = Arc::new(TestCase {
            id: TestId::new("p", "f", 1),
            ..(*a).clone()
        });
        let mut records = TestRecords::new();
        records.entry(&b);
        records.entry(&a);
        records.entry(&b).push(TestResult::new(TestStatus::Passed, 0));
        let ids: Vec<String> = records.iter().map(|r| r.test.id.to_string()).collect();
        assert_eq!(ids, vec!["p::f::1", "p::f::0"]);
        assert_eq!(records.len(), 2);
    }
}
