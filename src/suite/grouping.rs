// src/suite/grouping.rs

//! Splitting a project's tests into dispatchable groups.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConfigFile, FixtureConfig};
use crate::suite::{ProjectSuite, TestCase, TestGroup};
use crate::types::{FixtureScope, GroupMode};

/// Key deciding which tests may share a worker process: the project plus the
/// sorted set of worker-scoped fixtures the test needs.
pub fn worker_hash(test: &TestCase, fixtures: &BTreeMap<String, FixtureConfig>) -> String {
    let mut worker_fixtures: Vec<&str> = test
        .fixtures
        .iter()
        .filter(|name| {
            fixtures
                .get(name.as_str())
                .is_some_and(|f| f.scope == FixtureScope::Worker)
        })
        .map(String::as_str)
        .collect();
    worker_fixtures.sort_unstable();
    worker_fixtures.dedup();

    format!("{}|{}", test.project, worker_fixtures.join(","))
}

/// Build the groups for one project.
///
/// Per file, tests are bucketed by [`worker_hash`], keeping their order. In
/// `parallel` mode each bucket is further split into at most `worker_limit`
/// contiguous groups so several workers can share a file.
pub fn create_test_groups(
    config: &ConfigFile,
    project_suite: &ProjectSuite,
    worker_limit: usize,
) -> Vec<TestGroup> {
    let mode = config
        .project(&project_suite.project)
        .map(|p| p.mode)
        .unwrap_or_default();

    let mut groups = Vec::new();
    for file in project_suite.files.iter() {
        let mut buckets: Vec<(String, Vec<Arc<TestCase>>)> = Vec::new();
        for test in file.tests.iter() {
            let hash = worker_hash(test, &config.fixture);
            match buckets.iter_mut().find(|(h, _)| *h == hash) {
                Some((_, tests)) => tests.push(Arc::clone(test)),
                None => buckets.push((hash, vec![Arc::clone(test)])),
            }
        }

        for (hash, tests) in buckets {
            let chunks = match mode {
                GroupMode::Default => vec![tests],
                GroupMode::Parallel => split_evenly(tests, worker_limit.max(1)),
            };
            for chunk in chunks {
                groups.push(TestGroup {
                    project: project_suite.project.clone(),
                    worker_hash: hash.clone(),
                    file: file.path.clone(),
                    tests: chunk,
                });
            }
        }
    }

    groups
}

/// Split into at most `parts` contiguous, non-empty chunks whose sizes differ
/// by at most one.
fn split_evenly<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let parts = parts.min(items.len());
    if parts <= 1 {
        return vec![items];
    }

    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut out = Vec::with_capacity(parts);
    let mut iter = items.into_iter();
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{ProjectConfig, RawConfigFile, RunSection};
    use crate::suite::TestFile;
    use crate::types::TestId;

    fn test_case(file: &str, ordinal: usize, fixtures: &[&str]) -> Arc<TestCase> {
        Arc::new(TestCase {
            id: TestId::new("p", file, ordinal),
            title: format!("t{ordinal}"),
            project: "p".to_string(),
            file: PathBuf::from(file),
            cmd: "true".to_string(),
            fixtures: fixtures.iter().map(|s| s.to_string()).collect(),
            skip: false,
            retries: 0,
            timeout: None,
        })
    }

    fn config(mode: GroupMode) -> ConfigFile {
        let mut project = ProjectConfig::new("p");
        project.mode = mode;
        let mut fixture = BTreeMap::new();
        fixture.insert(
            "db".to_string(),
            FixtureConfig {
                scope: FixtureScope::Worker,
                ..FixtureConfig::default()
            },
        );
        fixture.insert("tmp".to_string(), FixtureConfig::default());
        ConfigFile::try_from(RawConfigFile {
            config: RunSection::default(),
            project: vec![project],
            fixture,
        })
        .unwrap()
    }

    #[test]
    fn test_scoped_fixtures_do_not_affect_worker_hash() {
        let cfg = config(GroupMode::Default);
        let plain = test_case("a", 0, &[]);
        let with_tmp = test_case("a", 1, &["tmp"]);
        let with_db = test_case("a", 2, &["db", "tmp"]);
        assert_eq!(worker_hash(&plain, &cfg.fixture), worker_hash(&with_tmp, &cfg.fixture));
        assert_ne!(worker_hash(&plain, &cfg.fixture), worker_hash(&with_db, &cfg.fixture));
    }

    #[test]
    fn buckets_by_worker_hash_per_file_in_order() {
        let cfg = config(GroupMode::Default);
        let suite = ProjectSuite {
            project: "p".to_string(),
            files: vec![
                TestFile {
                    path: PathBuf::from("a"),
                    tests: vec![test_case("a", 0, &[]), test_case("a", 1, &["db"]), test_case("a", 2, &[])],
                },
                TestFile {
                    path: PathBuf::from("b"),
                    tests: vec![test_case("b", 0, &[])],
                },
            ],
        };

        let groups = create_test_groups(&cfg, &suite, 4);
        let shape: Vec<Vec<String>> = groups
            .iter()
            .map(|g| g.tests.iter().map(|t| t.id.to_string()).collect())
            .collect();
        assert_eq!(
            shape,
            vec![
                vec!["p::a::0".to_string(), "p::a::2".to_string()],
                vec!["p::a::1".to_string()],
                vec!["p::b::0".to_string()],
            ]
        );
    }

    #[test]
    fn parallel_mode_splits_up_to_worker_limit() {
        let cfg = config(GroupMode::Parallel);
        let suite = ProjectSuite {
            project: "p".to_string(),
            files: vec![TestFile {
                path: PathBuf::from("a"),
                tests: (0..5).map(|i| test_case("a", i, &[])).collect(),
            }],
        };

        let sizes: Vec<usize> = create_test_groups(&cfg, &suite, 2)
            .iter()
            .map(|g| g.tests.len())
            .collect();
        assert_eq!(sizes, vec![3, 2]);

        let sizes: Vec<usize> = create_test_groups(&cfg, &suite, 10)
            .iter()
            .map(|g| g.tests.len())
            .collect();
        assert_eq!(sizes, vec![1, 1, 1, 1, 1]);
    }
}
