use std::sync::Arc;

use futures::future::BoxFuture;

use crate::body::NodeBody;
use crate::error::Result;
use crate::types::*;

/// Host policy: node types and leaf-invariant healing.
pub trait Policy: Send + Sync + 'static {
    /// Body class registered for a node type.
    fn body_for_node_type(&self, node_type: &str) -> Option<Arc<dyn NodeBody>>;

    /// Node types the policy knows about.
    fn node_types(&self) -> Vec<String>;

    /// Whether a leaf node (no outgoing active blocking edges) is acceptable.
    fn leaf_valid(&self, node: &Node) -> bool;

    /// Node to append after an invalid leaf. `None` leaves it unrepaired.
    fn leaf_repair_node_attributes(&self, leaf: &Node) -> Option<NewNode>;

    /// Edge connecting an invalid leaf to its repair node.
    fn leaf_repair_edge_attributes(&self, leaf: &Node, repaired: &Node) -> NewEdge {
        NewEdge::sequence(leaf.id.clone(), repaired.id.clone())
    }

    /// Convenience: whether pending nodes of this type are schedulable.
    fn is_executable(&self, node_type: &str) -> bool {
        self.body_for_node_type(node_type)
            .is_some_and(|b| b.executable())
    }
}

/// Audit event hook. Failures are logged by the caller, never propagated.
pub trait EventSink: Send + Sync + 'static {
    fn record_event(&self, event: &GraphEvent) -> Result<()>;
}

/// External summarizer used by auto-compaction.
pub trait Summarizer: Send + Sync + 'static {
    /// Produce summary text for the given context slice.
    fn summarize(&self, entries: Vec<ContextEntry>) -> BoxFuture<'_, Result<String>>;
}
