//! Dependency graph with cycle detection and deterministic topological sort.
//!
//! Nodes and edges are held as an explicit index-based adjacency structure
//! so cycle detection and ordering are testable in isolation from the
//! executor.

use std::collections::{BTreeSet, HashMap};

/// Index-based dependency graph over string ids.
///
/// Edges point from a dependency to its dependents. Ids referenced by an
/// edge but absent from the node set are ignored; the caller is responsible
/// for checking dependency presence before building the graph.
#[derive(Debug)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from `(id, dependencies)` pairs.
    ///
    /// Insertion order is the tie-break order of [`Self::topo_sort`]: among
    /// nodes with no relative constraint, the earlier-inserted node sorts
    /// first.
    pub fn new(nodes: &[(String, Vec<String>)]) -> Self {
        let ids: Vec<String> = nodes.iter().map(|(id, _)| id.clone()).collect();
        let index: HashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut dependents = vec![Vec::new(); ids.len()];
        let mut dependencies = vec![Vec::new(); ids.len()];
        for (i, (_, deps)) in nodes.iter().enumerate() {
            for dep in deps {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                    dependencies[i].push(d);
                }
            }
        }

        Self {
            ids,
            index,
            dependents,
            dependencies,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Index of an id, if present.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Kahn topological sort with deterministic ties (insertion order).
    ///
    /// On a cycle, returns the ids forming one cycle, in edge order.
    pub fn topo_sort(&self) -> Result<Vec<String>, Vec<String>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(self.ids[next].clone());
            for &dependent in &self.dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() == self.ids.len() {
            Ok(order)
        } else {
            Err(self.find_cycle(&in_degree))
        }
    }

    /// Walk the unresolved remainder until a node repeats, then cut the
    /// prefix so only the cycle members remain.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let start = in_degree
            .iter()
            .position(|&d| d > 0)
            .expect("cycle lookup on acyclic graph");

        let mut path: Vec<usize> = Vec::new();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&at) = seen.get(&current) {
                return path[at..].iter().map(|&i| self.ids[i].clone()).collect();
            }
            seen.insert(current, path.len());
            path.push(current);
            current = *self.dependencies[current]
                .iter()
                .find(|&&d| in_degree[d] > 0)
                .expect("unresolved node without unresolved dependency");
        }
    }
}
