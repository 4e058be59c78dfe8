use std::collections::{HashMap, HashSet};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;
use trellis_store::GraphRows;

use super::{order_and_project, AssembledContext, ContextAssembler, ContextRequest};

/// Ancestor closure computed in memory from the full node and edge set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullClosure;

impl FullClosure {
    /// Assemble from rows the caller already holds. `nodes` should be the
    /// graph's active nodes plus the target; archived nodes are skipped.
    pub fn assemble_from(&self, nodes: Vec<Node>, edges: &[Edge], request: &ContextRequest) -> Result<AssembledContext> {
        let mut by_id: HashMap<NodeId, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        if !by_id.contains_key(&request.target) {
            return Err(TrellisError::not_found("node", &request.target));
        }

        let mut parents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for edge in edges.iter().filter(|e| e.is_active() && e.is_blocking()) {
            parents.entry(&edge.to_node_id).or_default().push(&edge.from_node_id);
        }

        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![request.target.clone()];
        seen.insert(request.target.clone());
        while let Some(id) = stack.pop() {
            for parent in parents.get(&id).into_iter().flatten() {
                let active = by_id.get(*parent).is_some_and(|n| n.is_active());
                if active && seen.insert((*parent).clone()) {
                    stack.push((*parent).clone());
                }
            }
        }

        let closure: Vec<Node> = seen.iter().filter_map(|id| by_id.remove(id)).collect();
        Ok(AssembledContext {
            entries: order_and_project(closure, edges, request)?,
            scope: None,
        })
    }
}

impl ContextAssembler for FullClosure {
    fn assemble(&self, rows: &GraphRows<'_>, request: &ContextRequest) -> Result<AssembledContext> {
        let target = rows.node(&request.target)?;
        let mut nodes = rows.active_nodes()?;
        if !target.is_active() {
            nodes.push(target);
        }
        let edges = rows.active_blocking_edges()?;
        self.assemble_from(nodes, &edges, request)
    }
}
