use std::collections::{HashMap, HashSet, VecDeque};

use super::graph::{EdgeId, Graph};
use crate::error::{DistbuildError, Result};

/// Which edges still have to run, and which of them are ready.
///
/// Every edge reachable from the requested targets is built; there is no
/// staleness check. An edge becomes ready once each of its inputs built
/// by another wanted edge has finished successfully. A failed edge never
/// releases its dependents.
#[derive(Debug, Default)]
pub struct Plan {
    wanted: HashSet<EdgeId>,
    finished: HashSet<EdgeId>,
    /// Unfinished producing edges per wanted edge.
    blocked_on: HashMap<EdgeId, usize>,
    ready: VecDeque<EdgeId>,
    wanted_remaining: usize,
    command_edges: usize,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wants the edge producing `target` and everything it depends on.
    /// Source files with no producing edge add nothing.
    pub fn add_target(&mut self, graph: &Graph, target: &str) -> Result<()> {
        let node = graph
            .node(target)
            .ok_or_else(|| DistbuildError::UnknownTarget(target.to_string()))?;
        match graph.node_at(node).in_edge {
            Some(edge) => self.add_edge(graph, edge, &mut HashSet::new()),
            None => Ok(()),
        }
    }

    fn add_edge(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        visiting: &mut HashSet<EdgeId>,
    ) -> Result<()> {
        if self.wanted.contains(&edge) {
            return Ok(());
        }
        if !visiting.insert(edge) {
            return Err(DistbuildError::InvalidManifest(format!(
                "dependency cycle through {}",
                graph.edge(edge).spec.outputs.join(" ")
            )));
        }

        let mut producers = HashSet::new();
        for &input in &graph.edge(edge).inputs {
            if let Some(producer) = graph.node_at(input).in_edge {
                self.add_edge(graph, producer, visiting)?;
                if !self.finished.contains(&producer) {
                    producers.insert(producer);
                }
            }
        }
        visiting.remove(&edge);

        self.wanted.insert(edge);
        self.wanted_remaining += 1;
        if !graph.edge(edge).is_phony() {
            self.command_edges += 1;
        }
        if producers.is_empty() {
            self.ready.push_back(edge);
        } else {
            self.blocked_on.insert(edge, producers.len());
        }
        Ok(())
    }

    /// Next ready edge, in the order edges became ready.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        self.ready.pop_front()
    }

    pub fn edge_finished(&mut self, graph: &Graph, edge: EdgeId, success: bool) {
        if !self.wanted.contains(&edge) || !self.finished.insert(edge) {
            return;
        }
        self.wanted_remaining -= 1;
        if !success {
            return;
        }

        let mut released = HashSet::new();
        for &output in &graph.edge(edge).outputs {
            for &dependent in &graph.node_at(output).out_edges {
                if released.insert(dependent) {
                    self.release(dependent);
                }
            }
        }
    }

    fn release(&mut self, edge: EdgeId) {
        let Some(count) = self.blocked_on.get_mut(&edge) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.blocked_on.remove(&edge);
            self.ready.push_back(edge);
        }
    }

    /// True while some wanted edge has not finished.
    pub fn more_to_do(&self) -> bool {
        self.wanted_remaining > 0
    }

    pub fn is_finished(&self, edge: EdgeId) -> bool {
        self.finished.contains(&edge)
    }

    pub fn is_wanted(&self, edge: EdgeId) -> bool {
        self.wanted.contains(&edge)
    }

    /// Wanted edges that run a command.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }
}
