// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Wait-for graph over lock contexts.
//!
//! Built from a snapshot of the server lock table: every pending request or
//! pending upgrade waits for every other context currently holding the lock.
//! Cycles are reported only; nothing is aborted.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::ids::ThreadContext;

#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    /// waiter -> contexts it waits for
    edges: BTreeMap<ThreadContext, BTreeSet<ThreadContext>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` is blocked behind `holder`. Self edges are ignored.
    pub fn add_wait(&mut self, waiter: ThreadContext, holder: ThreadContext) {
        if waiter == holder {
            return;
        }
        self.edges.entry(waiter).or_default().insert(holder);
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn waiting_for(&self, waiter: &ThreadContext) -> Vec<ThreadContext> {
        self.edges
            .get(waiter)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All cycles reachable by DFS, each as the path from its first revisited context.
    pub fn detect_cycles(&self) -> Vec<Vec<ThreadContext>> {
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for start in self.edges.keys() {
            if !visited.contains(start) {
                self.dfs_detect(start, &mut visited, &mut rec_stack, &mut path, &mut cycles);
            }
        }

        cycles
    }

    // A back edge to a context still on the recursion stack closes a cycle.
    fn dfs_detect<'a>(
        &'a self,
        node: &'a ThreadContext,
        visited: &mut HashSet<&'a ThreadContext>,
        rec_stack: &mut HashSet<&'a ThreadContext>,
        path: &mut Vec<&'a ThreadContext>,
        cycles: &mut Vec<Vec<ThreadContext>>,
    ) {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(neighbors) = self.edges.get(node) {
            for neighbor in neighbors {
                if !visited.contains(neighbor) {
                    self.dfs_detect(neighbor, visited, rec_stack, path, cycles);
                } else if rec_stack.contains(neighbor) {
                    if let Some(cycle_start) = path.iter().position(|n| *n == neighbor) {
                        cycles.push(path[cycle_start..].iter().map(|c| (*c).clone()).collect());
                    }
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
    }
}
