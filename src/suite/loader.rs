// src/suite/loader.rs

//! Test discovery.
//!
//! Each project's `test_dir` is walked recursively; files whose path relative
//! to `test_dir` matches one of the project's `test_match` globs are parsed as
//! test files:
//!
//! ```toml
//! [[test]]
//! title = "logs in"
//! cmd = "./scripts/login.sh"
//! fixtures = ["db"]
//!
//! [[test]]
//! title = "not ready yet"
//! cmd = "true"
//! skip = true
//! ```
//!
//! A file that cannot be read or parsed is reported as a [`LoadError`] and
//! skipped; other files keep loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{ConfigFile, ProjectConfig};
use crate::fs::FileSystem;
use crate::suite::{ProjectSuite, Suite, TestCase, TestFile};
use crate::types::TestId;

/// A test file that failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub file: PathBuf,
    pub message: String,
}

/// Result of loading: whatever loaded, plus per-file errors.
#[derive(Debug, Clone, Default)]
pub struct LoadedSuite {
    pub suite: Suite,
    pub errors: Vec<LoadError>,
}

/// Turns configuration into a test tree.
pub trait SuiteLoader: Send + Sync {
    fn load_all_tests(&self, config: &ConfigFile) -> LoadedSuite;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTestFile {
    #[serde(default)]
    pub test: Vec<RawTest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTest {
    pub title: String,
    pub cmd: String,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Parsed test files keyed by path, owned by one loader instance.
#[derive(Debug, Default)]
pub struct FileCache {
    files: HashMap<PathBuf, Arc<RawTestFile>>,
}

impl FileCache {
    pub fn get(&self, path: &Path) -> Option<Arc<RawTestFile>> {
        self.files.get(path).cloned()
    }

    pub fn insert(&mut self, path: PathBuf, file: Arc<RawTestFile>) {
        self.files.insert(path, file);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

/// Loader for TOML test files.
#[derive(Debug)]
pub struct TomlSuiteLoader {
    fs: Arc<dyn FileSystem>,
    cache: Mutex<FileCache>,
}

impl TomlSuiteLoader {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            cache: Mutex::new(FileCache::default()),
        }
    }

    /// Forget every parsed file so the next load re-reads from disk.
    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    pub fn cached_files(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, FileCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_project(
        &self,
        config: &ConfigFile,
        project: &ProjectConfig,
        errors: &mut Vec<LoadError>,
    ) -> ProjectSuite {
        let test_dir = config.resolve(&project.test_dir);
        let mut suite = ProjectSuite {
            project: project.name.clone(),
            files: Vec::new(),
        };

        let matcher = match build_matcher(&project.test_match) {
            Ok(m) => m,
            Err(message) => {
                errors.push(LoadError {
                    file: test_dir,
                    message,
                });
                return suite;
            }
        };

        if !self.fs.is_dir(&test_dir) {
            warn!(project = %project.name, dir = ?test_dir, "test directory does not exist");
            return suite;
        }

        let mut candidates = Vec::new();
        if let Err(e) = self.collect_files(&test_dir, &mut candidates) {
            errors.push(LoadError {
                file: test_dir.clone(),
                message: format!("{e:#}"),
            });
        }

        for path in candidates {
            let Ok(relative) = path.strip_prefix(&test_dir).map(Path::to_path_buf) else {
                continue;
            };
            if !matcher.is_match(&relative) {
                continue;
            }

            match self.parse_file(&path) {
                Ok(raw) => match build_test_file(config, project, &relative, &raw) {
                    Ok(file) => {
                        debug!(
                            project = %project.name,
                            file = %relative.display(),
                            tests = file.tests.len(),
                            "loaded test file"
                        );
                        suite.files.push(file);
                    }
                    Err(message) => errors.push(LoadError { file: path, message }),
                },
                Err(message) => errors.push(LoadError { file: path, message }),
            }
        }

        suite
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
        for entry in self.fs.read_dir(dir)? {
            if self.fs.is_dir(&entry) {
                self.collect_files(&entry, out)?;
            } else if self.fs.is_file(&entry) {
                out.push(entry);
            }
        }
        Ok(())
    }

    fn parse_file(&self, path: &Path) -> Result<Arc<RawTestFile>, String> {
        if let Some(cached) = self.lock_cache().get(path) {
            return Ok(cached);
        }

        let contents = self.fs.read_to_string(path).map_err(|e| format!("{e:#}"))?;
        let raw: RawTestFile = toml::from_str(&contents).map_err(|e| e.to_string())?;
        let raw = Arc::new(raw);
        self.lock_cache().insert(path.to_path_buf(), Arc::clone(&raw));
        Ok(raw)
    }
}

impl SuiteLoader for TomlSuiteLoader {
    fn load_all_tests(&self, config: &ConfigFile) -> LoadedSuite {
        let mut errors = Vec::new();
        let projects = config
            .project
            .iter()
            .map(|project| self.load_project(config, project, &mut errors))
            .collect();

        LoadedSuite {
            suite: Suite { projects },
            errors,
        }
    }
}

fn build_matcher(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| format!("invalid test_match '{pattern}': {e}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| e.to_string())
}

fn build_test_file(
    config: &ConfigFile,
    project: &ProjectConfig,
    relative: &Path,
    raw: &RawTestFile,
) -> Result<TestFile, String> {
    let file_key = relative.to_string_lossy().replace('\\', "/");
    let project_retries = project.effective_retries(&config.config);
    let project_timeout = project.effective_timeout_ms(&config.config);

    let mut tests = Vec::with_capacity(raw.test.len());
    for (ordinal, t) in raw.test.iter().enumerate() {
        if let Some(unknown) = t.fixtures.iter().find(|f| !config.fixture.contains_key(*f)) {
            return Err(format!("test '{}' uses unknown fixture '{}'", t.title, unknown));
        }

        let timeout_ms = t.timeout_ms.unwrap_or(project_timeout);
        tests.push(Arc::new(TestCase {
            id: TestId::new(&project.name, &file_key, ordinal),
            title: t.title.clone(),
            project: project.name.clone(),
            file: relative.to_path_buf(),
            cmd: t.cmd.clone(),
            fixtures: t.fixtures.clone(),
            skip: t.skip,
            retries: t.retries.unwrap_or(project_retries),
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }));
    }

    Ok(TestFile {
        path: relative.to_path_buf(),
        tests,
    })
}
