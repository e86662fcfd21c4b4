use std::collections::HashMap;
use std::path::Path;

use super::manifest::{EdgeSpec, Manifest};
use crate::error::{DistbuildError, Result};

pub type EdgeId = usize;
pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct Edge {
    pub spec: EdgeSpec,
    pub hash: u32,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Edge {
    pub fn is_phony(&self) -> bool {
        self.spec.is_phony()
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: String,
    /// The edge producing this path, if any.
    pub in_edge: Option<EdgeId>,
    /// Edges consuming this path.
    pub out_edges: Vec<EdgeId>,
}

/// Dependency graph built from a [`Manifest`].
#[derive(Debug, Default)]
pub struct Graph {
    edges: Vec<Edge>,
    nodes: Vec<Node>,
    by_path: HashMap<String, NodeId>,
    by_hash: HashMap<u32, EdgeId>,
    defaults: Vec<NodeId>,
}

impl Graph {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_manifest(Manifest::load(path)?)
    }

    pub fn from_manifest(manifest: Manifest) -> Result<Self> {
        let mut graph = Graph::default();

        for spec in manifest.edges {
            if spec.outputs.is_empty() {
                return Err(DistbuildError::InvalidManifest(format!(
                    "edge `{}` has no outputs",
                    spec.command
                )));
            }
            let id = graph.edges.len();
            let hash = spec.hash();
            if let Some(&other) = graph.by_hash.get(&hash) {
                return Err(DistbuildError::InvalidManifest(format!(
                    "edges producing {:?} and {:?} share hash {:08x}",
                    graph.edges[other].spec.outputs, spec.outputs, hash
                )));
            }

            let inputs: Vec<NodeId> = spec.inputs.iter().map(|p| graph.node_for(p)).collect();
            let outputs: Vec<NodeId> = spec.outputs.iter().map(|p| graph.node_for(p)).collect();
            for &node in &outputs {
                if graph.nodes[node].in_edge.is_some() {
                    return Err(DistbuildError::InvalidManifest(format!(
                        "multiple edges produce {}",
                        graph.nodes[node].path
                    )));
                }
                graph.nodes[node].in_edge = Some(id);
            }
            for &node in &inputs {
                graph.nodes[node].out_edges.push(id);
            }

            graph.by_hash.insert(hash, id);
            graph.edges.push(Edge {
                spec,
                hash,
                inputs,
                outputs,
            });
        }

        graph.defaults = if manifest.defaults.is_empty() {
            graph
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.in_edge.is_some() && n.out_edges.is_empty())
                .map(|(id, _)| id)
                .collect()
        } else {
            manifest
                .defaults
                .iter()
                .map(|p| {
                    graph
                        .node(p)
                        .ok_or_else(|| DistbuildError::UnknownTarget(p.clone()))
                })
                .collect::<Result<_>>()?
        };

        Ok(graph)
    }

    fn node_for(&mut self, path: &str) -> NodeId {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            path: path.to_string(),
            in_edge: None,
            out_edges: Vec::new(),
        });
        self.by_path.insert(path.to_string(), id);
        id
    }

    pub fn node(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn node_at(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_by_hash(&self, hash: u32) -> Option<EdgeId> {
        self.by_hash.get(&hash).copied()
    }

    pub fn default_targets(&self) -> Vec<String> {
        self.defaults
            .iter()
            .map(|&id| self.nodes[id].path.clone())
            .collect()
    }

    /// True when an input of `edge` is built by a command in this graph,
    /// looking through phony edges. Such edges need intermediate artifacts
    /// that only exist on the master.
    pub fn must_run_locally(&self, edge: EdgeId) -> bool {
        let mut stack: Vec<EdgeId> = vec![edge];
        let mut seen = vec![false; self.edges.len()];
        while let Some(current) = stack.pop() {
            for &input in &self.edges[current].inputs {
                let Some(producer) = self.nodes[input].in_edge else {
                    continue;
                };
                if !self.edges[producer].is_phony() {
                    return true;
                }
                if !seen[producer] {
                    seen[producer] = true;
                    stack.push(producer);
                }
            }
        }
        false
    }

    /// Command edges keyed by hash: what a slave agrees to run.
    pub fn allow_list(&self) -> HashMap<u32, EdgeSpec> {
        self.edges
            .iter()
            .filter(|e| !e.is_phony())
            .map(|e| (e.hash, e.spec.clone()))
            .collect()
    }
}
