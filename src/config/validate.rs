// src/config/validate.rs

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, TestherdError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::TestherdError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_projects(cfg)?;
    validate_run_section(cfg)?;
    validate_project_names(cfg)?;
    validate_project_dependencies(cfg)?;
    validate_output_dirs(cfg)?;
    Ok(())
}

fn ensure_has_projects(cfg: &RawConfigFile) -> Result<()> {
    if cfg.project.is_empty() {
        return Err(TestherdError::ConfigError(
            "config must contain at least one [[project]] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_run_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.workers == 0 {
        return Err(TestherdError::ConfigError(
            "[config].workers must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_project_names(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();
    for project in cfg.project.iter() {
        if project.name.trim().is_empty() {
            return Err(TestherdError::ConfigError(
                "project name must not be empty".to_string(),
            ));
        }
        if !seen.insert(project.name.as_str()) {
            return Err(TestherdError::ConfigError(format!(
                "duplicate project name '{}'",
                project.name
            )));
        }
        if project.workers == Some(0) {
            return Err(TestherdError::ConfigError(format!(
                "project '{}' must allow at least one worker",
                project.name
            )));
        }
    }
    Ok(())
}

fn validate_project_dependencies(cfg: &RawConfigFile) -> Result<()> {
    let names: HashSet<&str> = cfg.project.iter().map(|p| p.name.as_str()).collect();
    for project in cfg.project.iter() {
        for dep in project.deps.iter() {
            if dep == &project.name {
                return Err(TestherdError::ConfigError(format!(
                    "project '{}' cannot depend on itself",
                    project.name
                )));
            }
            if !names.contains(dep.as_str()) {
                return Err(TestherdError::UnknownDependency {
                    project: project.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Output directories are wiped before a phase runs, so two projects must
/// never share one or nest inside each other.
fn validate_output_dirs(cfg: &RawConfigFile) -> Result<()> {
    let dirs: Vec<(&str, PathBuf)> = cfg
        .project
        .iter()
        .filter_map(|p| p.output_dir.as_deref().map(|d| (p.name.as_str(), normalize(d))))
        .collect();

    for (i, (a_name, a_dir)) in dirs.iter().enumerate() {
        for (b_name, b_dir) in dirs.iter().skip(i + 1) {
            if a_dir.starts_with(b_dir) || b_dir.starts_with(a_dir) {
                return Err(TestherdError::ConfigError(format!(
                    "projects '{}' and '{}' have overlapping output directories",
                    a_name, b_name
                )));
            }
        }
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::model::{ProjectConfig, RunSection};

    fn raw(projects: Vec<ProjectConfig>) -> RawConfigFile {
        RawConfigFile {
            config: RunSection::default(),
            project: projects,
            fixture: BTreeMap::new(),
        }
    }

    #[test]
    fn rejects_empty_project_list() {
        let err = ConfigFile::try_from(raw(vec![])).unwrap_err();
        assert!(matches!(err, TestherdError::ConfigError(_)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = ConfigFile::try_from(raw(vec![
            ProjectConfig::new("a"),
            ProjectConfig::new("a"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate project name"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut b = ProjectConfig::new("b");
        b.deps.push("ghost".to_string());
        let err = ConfigFile::try_from(raw(vec![ProjectConfig::new("a"), b])).unwrap_err();
        match err {
            TestherdError::UnknownDependency { project, dependency } => {
                assert_eq!(project, "b");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn rejects_nested_output_dirs() {
        let mut a = ProjectConfig::new("a");
        a.output_dir = Some(PathBuf::from("./out"));
        let mut b = ProjectConfig::new("b");
        b.output_dir = Some(PathBuf::from("out/b"));
        let err = ConfigFile::try_from(raw(vec![a, b])).unwrap_err();
        assert!(err.to_string().contains("overlapping output directories"));
    }

    #[test]
    fn accepts_disjoint_output_dirs() {
        let mut a = ProjectConfig::new("a");
        a.output_dir = Some(PathBuf::from("out/a"));
        let mut b = ProjectConfig::new("b");
        b.output_dir = Some(PathBuf::from("out/b"));
        assert!(ConfigFile::try_from(raw(vec![a, b])).is_ok());
    }
}
