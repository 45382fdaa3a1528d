//! The wait-for graph: directed edges between transactions, where
//! `A -> B` means A is waiting for a lock B holds. A cycle means deadlock.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

/// A multigraph: the same edge may be added once per conflicting holder
/// and is removed one copy at a time.
#[derive(Default)]
pub struct WaitForGraph {
    edges: RwLock<Vec<(Uuid, Uuid)>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&self, from: Uuid, to: Uuid) {
        self.edges.write().push((from, to));
    }

    /// Remove one copy of the edge; unknown edges are ignored.
    pub fn remove_edge(&self, from: Uuid, to: Uuid) {
        let mut edges = self.edges.write();
        if let Some(idx) = edges.iter().position(|&e| e == (from, to)) {
            edges.swap_remove(idx);
        }
    }

    /// Directed DFS with an on-stack set; reports only genuine cycles.
    pub fn detect_cycle(&self) -> bool {
        let edges = self.edges.read();
        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for &(from, to) in edges.iter() {
            adjacency.entry(from).or_default().push(to);
        }

        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        for &start in adjacency.keys() {
            if !visited.contains(&start)
                && Self::dfs(start, &adjacency, &mut visited, &mut on_stack)
            {
                return true;
            }
        }
        false
    }

    fn dfs(
        current: Uuid,
        adjacency: &HashMap<Uuid, Vec<Uuid>>,
        visited: &mut HashSet<Uuid>,
        on_stack: &mut HashSet<Uuid>,
    ) -> bool {
        visited.insert(current);
        on_stack.insert(current);
        if let Some(next) = adjacency.get(&current) {
            for &n in next {
                if on_stack.contains(&n) {
                    return true;
                }
                if !visited.contains(&n) && Self::dfs(n, adjacency, visited, on_stack) {
                    return true;
                }
            }
        }
        on_stack.remove(&current);
        false
    }
}
