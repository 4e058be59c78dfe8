//! Context assembly.
//!
//! Every assembler answers the same question: which nodes does the target
//! see, and in what order. The answer is a list of [`ContextEntry`]
//! projections in blocking-edge topological order.

mod ancestor;
mod full;
mod windowed;

pub use ancestor::AncestorClosure;
pub use full::FullClosure;
pub use windowed::{ContextScope, WindowedAssembler};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use trellis_core::error::Result;
use trellis_core::types::*;
use trellis_store::GraphRows;

use crate::topo::sort_nodes;

/// What to assemble.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub target: NodeId,
    pub mode: ContextMode,
    /// Keep deleted and context-excluded nodes.
    pub include_hidden: bool,
}

impl ContextRequest {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            mode: ContextMode::default(),
            include_hidden: false,
        }
    }

    pub fn with_mode(mut self, mode: ContextMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn include_hidden(mut self) -> Self {
        self.include_hidden = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssembledContext {
    pub entries: Vec<ContextEntry>,
    /// Selection rules behind a windowed assembly.
    pub scope: Option<ContextScope>,
}

impl AssembledContext {
    pub fn node_ids(&self) -> Vec<&NodeId> {
        self.entries.iter().map(|e| &e.node_id).collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.iter().any(|e| &e.node_id == id)
    }
}

/// Builds the context a node sees.
pub trait ContextAssembler: Send + Sync {
    fn assemble(&self, rows: &GraphRows<'_>, request: &ContextRequest) -> Result<AssembledContext>;
}

/// Sort `nodes` by the blocking edges among them, drop hidden nodes unless
/// asked not to (the target always stays), and project.
pub(crate) fn order_and_project(
    nodes: Vec<Node>,
    edges: &[Edge],
    request: &ContextRequest,
) -> Result<Vec<ContextEntry>> {
    let ids: HashSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
    let inner: Vec<Edge> = edges
        .iter()
        .filter(|e| e.is_active() && e.is_blocking())
        .filter(|e| ids.contains(&e.from_node_id) && ids.contains(&e.to_node_id))
        .cloned()
        .collect();
    let sorted = sort_nodes(nodes, &inner)?;
    Ok(sorted
        .iter()
        .filter(|n| request.include_hidden || n.id == request.target || n.is_visible())
        .map(|n| ContextEntry::project(n, request.mode))
        .collect())
}
