//! Wait-for graph cycle detection.
//!
//! The lock manager rebuilds this graph from waiter state on every
//! detection pass. Transaction ids are interned into a dense arena so
//! traversal state lives in flat vectors, and the search is an
//! explicit-stack DFS with white/gray/black marking. A gray node
//! reached twice closes a cycle; the cycle is the gray path from that
//! node to the top of the stack.

use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Directed graph of `waiter -> holder` edges over transaction ids.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, id: &str) -> usize {
        if let Some(&slot) = self.index.get(id) {
            return slot;
        }
        let slot = self.ids.len();
        self.ids.push(id.to_string());
        self.index.insert(id.to_string(), slot);
        self.edges.push(Vec::new());
        slot
    }

    /// Records that `waiter` cannot proceed until `holder` releases.
    pub fn add_edge(&mut self, waiter: &str, holder: &str) {
        let from = self.intern(waiter);
        let to = self.intern(holder);
        if !self.edges[from].contains(&to) {
            self.edges[from].push(to);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    /// Finds one cycle, in path order, or `None` when the graph is
    /// acyclic. Roots are explored in insertion order, so the result is
    /// stable for a given edge sequence.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let n = self.ids.len();
        let mut marks = vec![Mark::White; n];

        for root in 0..n {
            if marks[root] != Mark::White {
                continue;
            }
            // frames are (node, next edge offset); gray nodes are
            // exactly the nodes currently on this stack
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Gray;

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let cursor = frame.1;
                if cursor >= self.edges[node].len() {
                    marks[node] = Mark::Black;
                    stack.pop();
                    continue;
                }
                frame.1 += 1;
                let next = self.edges[node][cursor];
                match marks[next] {
                    Mark::Gray => {
                        let start = stack
                            .iter()
                            .position(|&(id, _)| id == next)
                            .unwrap_or(0);
                        let cycle = stack[start..]
                            .iter()
                            .map(|&(id, _)| self.ids[id].clone())
                            .collect();
                        return Some(cycle);
                    }
                    Mark::White => {
                        marks[next] = Mark::Gray;
                        stack.push((next, 0));
                    }
                    Mark::Black => {}
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_graph_has_no_cycle() {
        let graph = WaitForGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn chains_and_diamonds_are_acyclic() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("t1", "t2");
        graph.add_edge("t2", "t3");
        graph.add_edge("t1", "t4");
        graph.add_edge("t4", "t3");
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn self_wait_is_a_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("t1", "t1");
        assert_eq!(graph.find_cycle(), Some(vec!["t1".to_string()]));
    }

    #[test]
    fn three_party_cycle_comes_back_in_path_order() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("t1", "t2");
        graph.add_edge("t2", "t3");
        graph.add_edge("t3", "t1");
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn cycle_found_past_acyclic_branches() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("x", "y");
        graph.add_edge("y", "z");
        graph.add_edge("z", "x");
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle, vec!["x", "y", "z"]);
    }

    #[test]
    fn cycle_excludes_the_tail_leading_into_it() {
        // t1 waits into a loop between t2 and t3 but is not part of it
        let mut graph = WaitForGraph::new();
        graph.add_edge("t1", "t2");
        graph.add_edge("t2", "t3");
        graph.add_edge("t3", "t2");
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle, vec!["t2", "t3"]);
    }

    #[test]
    fn duplicate_edges_do_not_fabricate_cycles() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("t1", "t2");
        graph.add_edge("t1", "t2");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.find_cycle(), None);
    }
}
