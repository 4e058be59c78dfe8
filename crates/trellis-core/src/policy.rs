use std::sync::Arc;

use serde_json::json;

use crate::body::{BodyRegistry, NodeBody};
use crate::config::ContextConfig;
use crate::traits::Policy;
use crate::types::{node_types, Map, NewNode, Node, NodeState};

/// Policy backed by a [`BodyRegistry`].
///
/// A leaf is valid when it is an agent message (the conversation is waiting
/// on, or was answered by, the agent) or when it is executable work that has
/// not finished yet. Anything else gets a pending agent message appended.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    registry: BodyRegistry,
}

impl DefaultPolicy {
    pub fn new(registry: BodyRegistry) -> Self {
        Self { registry }
    }

    /// Built-in types with previews sized by `context.preview_chars`.
    pub fn from_config(context: &ContextConfig) -> Self {
        Self::new(BodyRegistry::with_preview_chars(context.preview_chars))
    }

    pub fn registry(&self) -> &BodyRegistry {
        &self.registry
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::new(BodyRegistry::with_defaults())
    }
}

impl Policy for DefaultPolicy {
    fn body_for_node_type(&self, node_type: &str) -> Option<Arc<dyn NodeBody>> {
        self.registry.get(node_type)
    }

    fn node_types(&self) -> Vec<String> {
        self.registry.node_types()
    }

    fn leaf_valid(&self, node: &Node) -> bool {
        if node.node_type == node_types::AGENT_MESSAGE {
            return true;
        }
        self.is_executable(&node.node_type)
            && matches!(node.state, NodeState::Pending | NodeState::Running)
    }

    fn leaf_repair_node_attributes(&self, leaf: &Node) -> Option<NewNode> {
        // Only settled leaves are healed; in-flight work may still append.
        if !leaf.state.is_terminal() {
            return None;
        }
        let mut metadata = Map::new();
        metadata.insert("generated_by".into(), json!("leaf_repair"));
        metadata.insert("repairs_node_id".into(), json!(leaf.id));
        let mut node = NewNode::new(node_types::AGENT_MESSAGE, NodeState::Pending)
            .with_metadata(metadata);
        node.lane_id = leaf.lane_id.clone();
        node.turn_id = leaf.turn_id.clone();
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GraphId, NodeId};
    use chrono::Utc;

    fn node(node_type: &str, state: NodeState) -> Node {
        Node {
            id: NodeId::new(),
            graph_id: GraphId::new(),
            node_type: node_type.into(),
            state,
            body_kind: node_type.into(),
            input: Map::new(),
            output: Map::new(),
            output_preview: Map::new(),
            metadata: Map::new(),
            lane_id: None,
            turn_id: None,
            idempotency_key: None,
            retry_of_id: None,
            error: None,
            compressed_at: None,
            compressed_by_id: None,
            context_excluded_at: None,
            deleted_at: None,
            claimed_at: None,
            claimed_by: None,
            lease_expires_at: None,
            heartbeat_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_leaf_validity() {
        let policy = DefaultPolicy::default();
        assert!(policy.leaf_valid(&node(node_types::AGENT_MESSAGE, NodeState::Finished)));
        assert!(policy.leaf_valid(&node(node_types::TASK, NodeState::Pending)));
        assert!(!policy.leaf_valid(&node(node_types::TASK, NodeState::Errored)));
        assert!(!policy.leaf_valid(&node(node_types::USER_MESSAGE, NodeState::Finished)));
    }

    #[test]
    fn test_preview_length_from_context_config() {
        let context = ContextConfig {
            preview_chars: 10,
            ..ContextConfig::default()
        };
        let policy = DefaultPolicy::from_config(&context);
        let mut output = Map::new();
        output.insert("content".into(), json!("x".repeat(50)));
        let body = policy.body_for_node_type(node_types::AGENT_MESSAGE).unwrap();
        assert_eq!(body.output_preview(&output)["content"], json!(format!("{}…", "x".repeat(10))));
    }

    #[test]
    fn test_repair_only_for_terminal_leaves() {
        let policy = DefaultPolicy::default();
        let pending = node(node_types::USER_MESSAGE, NodeState::Pending);
        assert!(policy.leaf_repair_node_attributes(&pending).is_none());

        let finished = node(node_types::USER_MESSAGE, NodeState::Finished);
        let repair = policy.leaf_repair_node_attributes(&finished).unwrap();
        assert_eq!(repair.node_type, node_types::AGENT_MESSAGE);
        assert_eq!(repair.state, NodeState::Pending);
        assert_eq!(repair.metadata["generated_by"], json!("leaf_repair"));

        let repaired = node(node_types::AGENT_MESSAGE, NodeState::Pending);
        let edge = policy.leaf_repair_edge_attributes(&finished, &repaired);
        assert_eq!(edge.from, finished.id);
        assert_eq!(edge.to, repaired.id);
    }
}
