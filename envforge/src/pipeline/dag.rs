//! Adjacency-list DAG over catalog stages.
//!
//! Stages are addressed by their declaration index; every ordering this
//! module produces breaks ties by declaration order so plans are stable.

use crate::catalog::{Catalog, StageDefinition};
use crate::errors::CycleDetectedError;
use std::collections::{BTreeSet, HashMap};

/// A directed acyclic graph of stages, read-only after construction.
#[derive(Debug, Clone)]
pub struct StageGraph {
    catalog: Catalog,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    execution_order: Vec<usize>,
}

impl StageGraph {
    /// Builds the graph for a validated catalog.
    #[must_use]
    pub fn new(catalog: Catalog) -> Self {
        let stages = catalog.stages();
        let index: HashMap<String, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); stages.len()];
        let mut dependents = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                if let Some(&d) = index.get(dep) {
                    if !dependencies[i].contains(&d) {
                        dependencies[i].push(d);
                        dependents[d].push(i);
                    }
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let execution_order = topological_sort(&dependencies, &dependents);

        Self {
            catalog,
            index,
            dependencies,
            dependents,
            execution_order,
        }
    }

    /// The underlying catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Stage at a declaration index.
    #[must_use]
    pub fn stage(&self, idx: usize) -> &StageDefinition {
        &self.catalog.stages()[idx]
    }

    /// Declaration index of a stage id.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependencies of a stage.
    #[must_use]
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Direct dependents of a stage, in declaration order.
    #[must_use]
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Topological order, ties broken by declaration order.
    #[must_use]
    pub fn execution_order(&self) -> &[usize] {
        &self.execution_order
    }

    /// Stage ids in topological order.
    #[must_use]
    pub fn execution_order_ids(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .map(|&i| self.stage(i).id.as_str())
            .collect()
    }

    /// All transitive dependents of a stage, in declaration order.
    #[must_use]
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![idx];
        while let Some(node) = stack.pop() {
            for &child in &self.dependents[node] {
                if seen.insert(child) {
                    stack.push(child);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Groups stages into waves: wave `k` holds the stages whose longest
    /// dependency chain has length `k`. Every stage in a wave could run
    /// concurrently once the previous waves are done.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.stage_count()];
        for &node in &self.execution_order {
            depth[node] = self.dependencies[node]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        let levels = depth.iter().copied().max().map_or(0, |m| m + 1);
        let mut waves = vec![Vec::new(); levels];
        for (node, &d) in depth.iter().enumerate() {
            waves[d].push(node);
        }
        waves
    }
}

/// Kahn's algorithm with a declaration-ordered ready set.
fn topological_sort(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &child in &dependents[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }
    order
}

/// Finds a dependency cycle, returning its path (first node repeated at the end).
///
/// Unknown dependency ids are ignored here; catalog validation reports them.
#[must_use]
pub fn detect_cycle(stages: &[StageDefinition]) -> Option<CycleDetectedError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: usize,
        stages: &[StageDefinition],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        path.push(node);

        for dep in &stages[node].depends_on {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, stages, index, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let index: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; stages.len()];

    for start in 0..stages.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = visit(start, stages, &index, &mut marks, &mut path) {
            return Some(CycleDetectedError::new(
                cycle.into_iter().map(|i| stages[i].id.clone()).collect(),
            ));
        }
    }
    None
}
