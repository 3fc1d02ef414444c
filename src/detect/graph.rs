//! Directed dependency graph with DFS cycle detection.
//!
//! Nodes are opaque identities; the tracker instantiates the graph over
//! continuation IDs, an edge `A -> B` meaning "A wants a lock held by
//! B". Cycle finding is a plain DFS with a recursion stack; every cycle
//! reachable from some root is reported, with the closing node appended
//! so consumers can walk edges pairwise.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A directed graph over opaque node identities.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    adjacency: HashMap<N, HashSet<N>>,
}

impl<N: Clone + Eq + Hash> DependencyGraph<N> {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adjacency: HashMap::new(),
        }
    }

    /// Inserts `node` with no edges; a no-op if it already exists.
    pub fn add_node(&mut self, node: N) {
        self.adjacency.entry(node).or_default();
    }

    /// Inserts the directed edge `source -> target`, creating both nodes
    /// as needed.
    pub fn add_edge(&mut self, source: N, target: N) {
        self.add_node(target.clone());
        self.adjacency.entry(source).or_default().insert(target);
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Whether any cycle exists, stopping at the first one found.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();
        for node in self.adjacency.keys() {
            if !visited.contains(node) {
                self.dfs_cycles(node, &mut visited, &mut stack, &mut path, &mut cycles);
                if !cycles.is_empty() {
                    return true;
                }
            }
        }
        false
    }

    /// Every cycle reachable by DFS, each with its first node repeated
    /// at the end to close the loop.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<N>> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();
        for node in self.adjacency.keys() {
            if !visited.contains(node) {
                self.dfs_cycles(node, &mut visited, &mut stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn dfs_cycles(
        &self,
        node: &N,
        visited: &mut HashSet<N>,
        stack: &mut HashSet<N>,
        path: &mut Vec<N>,
        cycles: &mut Vec<Vec<N>>,
    ) {
        visited.insert(node.clone());
        stack.insert(node.clone());
        path.push(node.clone());

        if let Some(adjacent) = self.adjacency.get(node) {
            for next in adjacent {
                if stack.contains(next) {
                    // The recursion stack closes here; the cycle is the
                    // path suffix starting at `next`.
                    if let Some(start) = path.iter().position(|seen| seen == next) {
                        let mut cycle: Vec<N> = path[start..].to_vec();
                        cycle.push(next.clone());
                        cycles.push(cycle);
                    }
                } else if !visited.contains(next) {
                    self.dfs_cycles(next, visited, stack, path, cycles);
                }
            }
        }

        stack.remove(node);
        path.pop();
    }
}

impl<N: Clone + Eq + Hash> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self::new()
    }
}
