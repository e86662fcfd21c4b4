//! Build graph, plan, and slave capacity bookkeeping.
//!
//! - [`manifest`]: JSON build description
//! - [`graph`]: nodes and edges, edge hashes, local-only detection
//! - [`plan`]: ready-work discovery and completion tracking
//! - [`assigner`]: admitted slaves and most-spare-capacity selection

pub mod assigner;
pub mod graph;
pub mod manifest;
pub mod plan;

pub use assigner::{Admission, SlaveInfo, SlaveSummary, SlaveTable};
pub use graph::{Edge, EdgeId, Graph, Node, NodeId};
pub use manifest::{EdgeSpec, Manifest, PHONY_RULE};
pub use plan::Plan;
