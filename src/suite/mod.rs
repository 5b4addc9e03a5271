// src/suite/mod.rs

//! The loaded test tree and the unit of dispatch.
//!
//! - [`loader`] turns test files on disk into a [`Suite`].
//! - [`grouping`] splits a project's tests into [`TestGroup`]s that can each
//!   run inside a single worker process.

pub mod grouping;
pub mod loader;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{ProjectName, TestId};

pub use grouping::{create_test_groups, worker_hash};
pub use loader::{FileCache, LoadError, LoadedSuite, SuiteLoader, TomlSuiteLoader};

/// A single test as discovered by the loader.
///
/// Settings are already resolved: `retries` and `timeout` take the test's own
/// value, then the project's, then the global default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: TestId,
    pub title: String,
    pub project: ProjectName,
    /// Path of the defining file, relative to the project's test directory.
    pub file: PathBuf,
    /// Shell command that constitutes the test body.
    pub cmd: String,
    /// Fixture names the test uses, in declaration order.
    pub fixtures: Vec<String>,
    pub skip: bool,
    pub retries: u32,
    /// `None` means the test may run indefinitely.
    pub timeout: Option<Duration>,
}

impl TestCase {
    /// Human readable `project › file › title` path.
    pub fn full_title(&self) -> String {
        format!("{} › {} › {}", self.project, self.file.display(), self.title)
    }

    /// Total number of attempts this test may take.
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestFile {
    pub path: PathBuf,
    pub tests: Vec<Arc<TestCase>>,
}

#[derive(Debug, Clone)]
pub struct ProjectSuite {
    pub project: ProjectName,
    pub files: Vec<TestFile>,
}

impl ProjectSuite {
    pub fn tests(&self) -> impl Iterator<Item = &Arc<TestCase>> {
        self.files.iter().flat_map(|f| f.tests.iter())
    }
}

/// Full test tree: projects, their files, their tests.
#[derive(Debug, Clone, Default)]
pub struct Suite {
    pub projects: Vec<ProjectSuite>,
}

impl Suite {
    pub fn project(&self, name: &str) -> Option<&ProjectSuite> {
        self.projects.iter().find(|p| p.project == name)
    }

    pub fn all_tests(&self) -> impl Iterator<Item = &Arc<TestCase>> {
        self.projects.iter().flat_map(|p| p.tests())
    }

    pub fn test_count(&self) -> usize {
        self.all_tests().count()
    }
}

/// An ordered batch of tests dispatched as one unit to a single worker.
///
/// All tests belong to `project` and share `worker_hash`, which is the key
/// deciding whether an idle worker may be reused for this group.
#[derive(Debug, Clone)]
pub struct TestGroup {
    pub project: ProjectName,
    pub worker_hash: String,
    pub file: PathBuf,
    pub tests: Vec<Arc<TestCase>>,
}
