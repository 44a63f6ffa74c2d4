//! Dependency graph resolution and wave planning
//!
//! Edges point from a dependency to its dependent. Every member of an OR-group
//! contributes an edge, so `a|b` orders the check after both `a` and `b`.

use crate::config::CheckSpec;
use crate::error::{EngineError, EngineResult};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Checks that may run concurrently, sorted by id
pub type Level = Vec<String>;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph, failing on unknown dependencies and cycles
    pub fn build(checks: &BTreeMap<String, CheckSpec>) -> EngineResult<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in checks.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }

        for (id, check) in checks {
            let dependent = index[id];
            for dep in check.dependency_ids() {
                let dependency = *index
                    .get(&dep)
                    .ok_or_else(|| EngineError::unknown_dependency(id, &dep))?;
                graph.update_edge(dependency, dependent, ());
            }
        }

        let resolved = Self { graph, index };
        let all: BTreeSet<String> = checks.keys().cloned().collect();
        if let Some(members) = resolved.find_cycle(&all) {
            return Err(EngineError::cycle(members));
        }
        debug!(
            "Built dependency graph with {} checks and {} edges",
            resolved.graph.node_count(),
            resolved.graph.edge_count()
        );
        Ok(resolved)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Transitive dependents of `id`, excluding `id` itself
    pub fn dependents_closure(&self, id: &str) -> BTreeSet<String> {
        self.closure(id, Direction::Outgoing)
    }

    /// Transitive dependencies of `id`, excluding `id` itself
    pub fn dependencies_closure(&self, id: &str) -> BTreeSet<String> {
        self.closure(id, Direction::Incoming)
    }

    fn closure(&self, id: &str, direction: Direction) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = self.neighbors(id, direction);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.neighbors(&next, direction));
            }
        }
        seen.remove(id);
        seen
    }

    /// DFS over the subset; returns the cycle path closed on its first member
    fn find_cycle(&self, subset: &BTreeSet<String>) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for start in subset {
            if !visited.contains(start.as_str())
                && self.cycle_dfs(start, subset, &mut visited, &mut on_stack, &mut path)
            {
                return Some(path);
            }
        }
        None
    }

    fn cycle_dfs(
        &self,
        node: &str,
        subset: &BTreeSet<String>,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        for next in self.dependents(node) {
            if !subset.contains(&next) {
                continue;
            }
            if on_stack.contains(&next) {
                // Trim the path to the cycle itself
                if let Some(pos) = path.iter().position(|p| p == &next) {
                    path.drain(..pos);
                }
                path.push(next);
                return true;
            }
            if !visited.contains(&next) && self.cycle_dfs(&next, subset, visited, on_stack, path) {
                return true;
            }
        }

        on_stack.remove(node);
        path.pop();
        false
    }

    /// Greedy layering: each node lands one level after its deepest selected dependency
    pub fn compute_waves(&self, selected: &BTreeSet<String>) -> Vec<Level> {
        let mut depth: BTreeMap<String, usize> = BTreeMap::new();

        fn visit(
            graph: &DependencyGraph,
            id: &str,
            selected: &BTreeSet<String>,
            depth: &mut BTreeMap<String, usize>,
        ) -> usize {
            if let Some(d) = depth.get(id) {
                return *d;
            }
            let d = graph
                .dependencies(id)
                .iter()
                .filter(|dep| selected.contains(*dep))
                .map(|dep| visit(graph, dep, selected, depth) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.to_string(), d);
            d
        }

        for id in selected.iter().filter(|id| self.contains(id)) {
            visit(self, id, selected, &mut depth);
        }

        let levels = depth.values().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut waves: Vec<Level> = vec![Vec::new(); levels];
        // BTreeMap iteration keeps each level sorted by id
        for (id, d) in depth {
            waves[d].push(id);
        }
        waves
    }

    /// Waves for re-running `target` and its dependents that are part of `plan`
    pub fn subgraph_from(&self, target: &str, plan: &BTreeSet<String>) -> EngineResult<Vec<Level>> {
        if !self.contains(target) {
            return Err(EngineError::internal(format!(
                "forward run targets unknown check '{}'",
                target
            )));
        }
        let mut nodes: BTreeSet<String> = self
            .dependents_closure(target)
            .into_iter()
            .filter(|id| plan.contains(id))
            .collect();
        nodes.insert(target.to_string());

        if let Some(members) = self.find_cycle(&nodes) {
            return Err(EngineError::cycle(members));
        }
        Ok(self.compute_waves(&nodes))
    }
}
