use trellis_core::error::Result;
use trellis_store::GraphRows;

use super::{order_and_project, AssembledContext, ContextAssembler, ContextRequest};

/// Ancestor closure computed by a recursive query in the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct AncestorClosure;

impl ContextAssembler for AncestorClosure {
    fn assemble(&self, rows: &GraphRows<'_>, request: &ContextRequest) -> Result<AssembledContext> {
        rows.node(&request.target)?;
        let ids = rows.ancestor_ids(&request.target)?;
        let nodes = rows.nodes_by_ids(&ids)?;
        let edges = rows.active_blocking_edges_within(&ids)?;
        Ok(AssembledContext {
            entries: order_and_project(nodes, &edges, request)?,
            scope: None,
        })
    }
}
