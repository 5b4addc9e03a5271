// src/dag/phases.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::config::ProjectConfig;
use crate::errors::{Result, TestherdError};
use crate::types::ProjectName;

/// An ordered batch of projects whose dependencies all live in earlier phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub index: usize,
    /// Project names in discovery order.
    pub projects: Vec<ProjectName>,
}

/// Partition projects into dependency phases.
///
/// Each pass over the still-unassigned projects collects those whose every
/// dependency was assigned in an *earlier* pass; they form the next phase, in
/// discovery order. A pass that assigns nothing while projects remain means
/// the dependency relation has a cycle.
pub fn build_phases(projects: &[ProjectConfig]) -> Result<Vec<Phase>> {
    let known: HashSet<&str> = projects.iter().map(|p| p.name.as_str()).collect();
    for project in projects {
        if let Some(dep) = project.deps.iter().find(|d| !known.contains(d.as_str())) {
            return Err(TestherdError::UnknownDependency {
                project: project.name.clone(),
                dependency: dep.clone(),
            });
        }
    }

    let mut phase_of: HashMap<&str, usize> = HashMap::new();
    let mut remaining: Vec<&ProjectConfig> = projects.iter().collect();
    let mut phases = Vec::new();

    while !remaining.is_empty() {
        let index = phases.len();
        let (eligible, blocked): (Vec<&ProjectConfig>, Vec<&ProjectConfig>) =
            remaining.into_iter().partition(|p| {
                p.deps
                    .iter()
                    .all(|d| phase_of.get(d.as_str()).is_some_and(|&i| i < index))
            });

        if eligible.is_empty() {
            return Err(TestherdError::CircularDependency(describe_cycle(&blocked)));
        }

        for p in eligible.iter() {
            phase_of.insert(p.name.as_str(), index);
        }
        let names: Vec<ProjectName> = eligible.iter().map(|p| p.name.clone()).collect();
        debug!(phase = index, projects = ?names, "built dependency phase");
        phases.push(Phase {
            index,
            projects: names,
        });
        remaining = blocked;
    }

    Ok(phases)
}

/// Name one cycle among the projects that could not be scheduled.
///
/// Blocked projects include both cycle members and projects that merely
/// depend on a cycle; a topological sort of the blocked subgraph points at a
/// real participant, from which the cycle path is recovered.
fn describe_cycle(blocked: &[&ProjectConfig]) -> String {
    let by_name: HashMap<&str, &ProjectConfig> =
        blocked.iter().map(|p| (p.name.as_str(), *p)).collect();

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for p in blocked {
        graph.add_node(p.name.as_str());
    }
    for p in blocked {
        for dep in p.deps.iter().filter(|d| by_name.contains_key(d.as_str())) {
            graph.add_edge(dep.as_str(), p.name.as_str(), ());
        }
    }

    let start = match toposort(&graph, None) {
        Err(cycle) => cycle.node_id(),
        // Unreachable for a pass that made no progress; fall back to the
        // first blocked project.
        Ok(_) => blocked.first().map(|p| p.name.as_str()).unwrap_or("?"),
    };

    match cycle_path(start, &by_name) {
        Some(path) => path
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(" -> "),
        None => format!("'{start}'"),
    }
}

/// Depth-first walk along dependencies looking for a way back to `start`.
fn cycle_path<'a>(
    start: &'a str,
    by_name: &HashMap<&'a str, &'a ProjectConfig>,
) -> Option<Vec<&'a str>> {
    fn walk<'a>(
        current: &'a str,
        start: &'a str,
        by_name: &HashMap<&'a str, &'a ProjectConfig>,
        path: &mut Vec<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> bool {
        let Some(project) = by_name.get(current) else {
            return false;
        };
        for dep in project.deps.iter() {
            let dep = dep.as_str();
            let Some((&dep_key, _)) = by_name.get_key_value(dep) else {
                continue;
            };
            if dep_key == start {
                path.push(dep_key);
                return true;
            }
            if visited.insert(dep_key) {
                path.push(dep_key);
                if walk(dep_key, start, by_name, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    walk(start, start, by_name, &mut path, &mut visited).then_some(path)
}
