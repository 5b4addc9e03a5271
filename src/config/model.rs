// src/config/model.rs

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Result, TestherdError};
use crate::types::{FixtureScope, GroupMode, ProjectName};

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// workers = 2
/// retries = 1
///
/// [[project]]
/// name = "setup"
/// test_dir = "tests/setup"
///
/// [[project]]
/// name = "e2e"
/// test_dir = "tests/e2e"
/// deps = ["setup"]
///
/// [fixture.db]
/// scope = "worker"
/// setup = "./start-db.sh"
/// teardown = "./stop-db.sh"
/// ```
///
/// Projects are an array of tables so that discovery order is preserved.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Global run behaviour from `[config]`.
    #[serde(default)]
    pub config: RunSection,

    /// All projects from `[[project]]`, in file order.
    #[serde(default)]
    pub project: Vec<ProjectConfig>,

    /// Fixture definitions from `[fixture.<name>]`.
    #[serde(default)]
    pub fixture: BTreeMap<String, FixtureConfig>,
}

/// Validated configuration.
///
/// Construct with `ConfigFile::try_from(raw)` (see `validate.rs`) or through
/// [`crate::config::load_and_validate`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: RunSection,
    pub project: Vec<ProjectConfig>,
    pub fixture: BTreeMap<String, FixtureConfig>,
    /// Directory relative paths (test dirs, output dirs) are resolved against.
    /// Empty means "relative to the working directory".
    pub root_dir: PathBuf,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    /// Maximum number of concurrently running worker processes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default number of retries for a failing test.
    #[serde(default)]
    pub retries: u32,

    /// Default per-test timeout in milliseconds; `0` disables it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Budget for the whole invocation in milliseconds; `0` disables it.
    #[serde(default)]
    pub global_timeout_ms: u64,

    /// How long a worker may take to stop gracefully before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Treat an empty suite as success.
    #[serde(default)]
    pub pass_with_no_tests: bool,

    /// Shell command run once before any project.
    #[serde(default)]
    pub global_setup: Option<String>,

    /// Shell command run once after everything else, even on failure.
    #[serde(default)]
    pub global_teardown: Option<String>,
}

fn default_workers() -> usize {
    2
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retries: 0,
            timeout_ms: default_timeout_ms(),
            global_timeout_ms: 0,
            stop_grace_ms: default_stop_grace_ms(),
            pass_with_no_tests: false,
            global_setup: None,
            global_teardown: None,
        }
    }
}

impl RunSection {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        (self.global_timeout_ms > 0).then(|| Duration::from_millis(self.global_timeout_ms))
    }
}

/// `[[project]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: ProjectName,

    /// Directory searched for test files.
    #[serde(default = "default_test_dir")]
    pub test_dir: PathBuf,

    /// Glob patterns (relative to `test_dir`) selecting test files.
    #[serde(default = "default_test_match")]
    pub test_match: Vec<String>,

    /// Projects that must fully succeed before this one runs.
    #[serde(default)]
    pub deps: Vec<ProjectName>,

    /// Upper bound on workers busy with this project at the same time.
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Directory for test artifacts; wiped before the project's phase runs.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub mode: GroupMode,
}

fn default_test_dir() -> PathBuf {
    PathBuf::from(".")
}

pub fn default_test_match() -> Vec<String> {
    vec!["**/*.test.toml".to_string()]
}

impl ProjectConfig {
    pub fn new(name: impl Into<ProjectName>) -> Self {
        Self {
            name: name.into(),
            test_dir: default_test_dir(),
            test_match: default_test_match(),
            deps: Vec::new(),
            workers: None,
            retries: None,
            timeout_ms: None,
            output_dir: None,
            mode: GroupMode::Default,
        }
    }

    pub fn effective_retries(&self, run: &RunSection) -> u32 {
        self.retries.unwrap_or(run.retries)
    }

    pub fn effective_timeout_ms(&self, run: &RunSection) -> u64 {
        self.timeout_ms.unwrap_or(run.timeout_ms)
    }

    /// Worker limit for this project, never above the global pool size.
    pub fn effective_workers(&self, run: &RunSection) -> usize {
        self.workers.unwrap_or(run.workers).min(run.workers).max(1)
    }
}

/// `[fixture.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureConfig {
    #[serde(default)]
    pub scope: FixtureScope,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub teardown: Option<String>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            config: raw.config,
            project: raw.project,
            fixture: raw.fixture,
            root_dir: PathBuf::new(),
        }
    }

    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = root.into();
        self
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.project.iter().find(|p| p.name == name)
    }

    /// Resolve a configured path against the config's root directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    /// Keep only the named projects plus everything they transitively
    /// depend on. An empty selection keeps every project.
    pub fn select_projects(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }

        let mut keep: HashSet<ProjectName> = HashSet::new();
        let mut stack: Vec<ProjectName> = Vec::new();
        for name in names {
            if self.project(name).is_none() {
                return Err(TestherdError::ConfigError(format!(
                    "project '{name}' not found in configuration"
                )));
            }
            stack.push(name.clone());
        }

        while let Some(name) = stack.pop() {
            if !keep.insert(name.clone()) {
                continue;
            }
            if let Some(project) = self.project(&name) {
                stack.extend(project.deps.iter().cloned());
            }
        }

        self.project.retain(|p| keep.contains(&p.name));
        Ok(self)
    }
}
