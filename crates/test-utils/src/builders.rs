#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use testherd::config::{ConfigFile, FixtureConfig, ProjectConfig, RawConfigFile, RunSection};
use testherd::suite::{TestCase, TestGroup};
use testherd::types::{FixtureScope, TestId};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: RunSection::default(),
                project: Vec::new(),
                fixture: BTreeMap::new(),
            },
        }
    }

    pub fn with_project(mut self, project: ProjectConfig) -> Self {
        self.config.project.push(project);
        self
    }

    pub fn with_fixture(mut self, name: &str, scope: FixtureScope, teardown: Option<&str>) -> Self {
        self.config.fixture.insert(
            name.to_string(),
            FixtureConfig {
                scope,
                setup: None,
                teardown: teardown.map(str::to_string),
            },
        );
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.config.workers = n;
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.config.config.retries = n;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.config.timeout_ms = ms;
        self
    }

    pub fn stop_grace_ms(mut self, ms: u64) -> Self {
        self.config.config.stop_grace_ms = ms;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ProjectConfig`.
pub struct ProjectBuilder {
    project: ProjectConfig,
}

impl ProjectBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            project: ProjectConfig::new(name),
        }
    }

    pub fn dep(mut self, dep: &str) -> Self {
        self.project.deps.push(dep.to_string());
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.project.workers = Some(n);
        self
    }

    pub fn test_dir(mut self, dir: &str) -> Self {
        self.project.test_dir = PathBuf::from(dir);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project.output_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> ProjectConfig {
        self.project
    }
}

/// Builder for `TestCase`.
pub struct TestCaseBuilder {
    test: TestCase,
    ordinal: usize,
}

impl TestCaseBuilder {
    pub fn new(project: &str, title: &str) -> Self {
        Self {
            test: TestCase {
                id: TestId::new(project, "a.test.toml", 0),
                title: title.to_string(),
                project: project.to_string(),
                file: PathBuf::from("a.test.toml"),
                cmd: "true".to_string(),
                fixtures: Vec::new(),
                skip: false,
                retries: 0,
                timeout: None,
            },
            ordinal: 0,
        }
    }

    /// Position within the file; keeps ids distinct.
    pub fn ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn file(mut self, file: &str) -> Self {
        self.test.file = PathBuf::from(file);
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.test.retries = n;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.test.timeout = Some(Duration::from_millis(ms));
        self
    }

    pub fn skip(mut self) -> Self {
        self.test.skip = true;
        self
    }

    pub fn build(mut self) -> Arc<TestCase> {
        let file = self.test.file.to_string_lossy().to_string();
        self.test.id = TestId::new(&self.test.project, &file, self.ordinal);
        Arc::new(self.test)
    }
}

/// A group of `tests` from `project` sharing `hash`.
pub fn group(project: &str, hash: &str, tests: Vec<Arc<TestCase>>) -> TestGroup {
    let file = tests
        .first()
        .map(|t| t.file.clone())
        .unwrap_or_default();
    TestGroup {
        project: project.to_string(),
        worker_hash: hash.to_string(),
        file,
        tests,
    }
}
