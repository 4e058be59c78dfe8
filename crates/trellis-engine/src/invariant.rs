//! Leaf invariant: every active leaf must be acceptable to the policy.

use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use trellis_core::error::Result;
use trellis_core::types::*;

use crate::mutation::Mutator;

impl<'a> Mutator<'a> {
    /// Append a policy-supplied node after every invalid leaf. Leaves in
    /// archived lanes are left alone. Returns the repair nodes created.
    pub fn repair_leaf_invariant(&mut self) -> Result<Vec<Node>> {
        let archived_lanes: HashSet<LaneId> = self
            .rows()
            .lanes()?
            .into_iter()
            .filter(|l| l.is_archived())
            .map(|l| l.id)
            .collect();

        let mut repaired = Vec::new();
        for leaf in self.rows().leaves()? {
            if leaf.lane_id.as_ref().is_some_and(|l| archived_lanes.contains(l)) {
                continue;
            }
            if self.policy().leaf_valid(&leaf) {
                continue;
            }
            let Some(mut new) = self.policy().leaf_repair_node_attributes(&leaf) else {
                continue;
            };
            // Repairs are always fresh nodes.
            new.idempotency_key = None;
            if let Some(turn_id) = &new.turn_id {
                if self.rows().find_turn(turn_id)?.is_none() {
                    warn!(leaf_id = %leaf.id, turn_id = %turn_id, "Repair node names an unknown turn, dropping it");
                    new.turn_id = None;
                }
            }

            let node = self.create_node(new)?;
            let link = self.policy().leaf_repair_edge_attributes(&leaf, &node);
            let edge = self.create_edge(link)?;
            info!(leaf_id = %leaf.id, repair_id = %node.id, node_type = %node.node_type, "Leaf invariant repaired");
            self.emit(
                EventType::LeafInvariantRepaired,
                SubjectType::Node,
                &leaf.id,
                json!({
                    "repair_node_id": node.id,
                    "edge_id": edge.id,
                    "leaf_state": leaf.state,
                }),
            );
            repaired.push(node);
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[test]
    fn test_finished_user_leaf_gets_agent_reply() {
        let (engine, sink) = engine_with_sink();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message"]);

        let repaired = engine.mutate(&graph.id, |m| m.repair_leaf_invariant()).unwrap();
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].node_type, node_types::AGENT_MESSAGE);
        assert_eq!(repaired[0].state, NodeState::Pending);
        let incoming = engine.read(&graph.id, |rows| rows.active_incoming(&repaired[0].id)).unwrap();
        assert_eq!(incoming[0].from_node_id, ids[0]);
        assert_eq!(sink.count(EventType::LeafInvariantRepaired), 1);

        // The pending agent message is itself a valid leaf.
        assert!(engine.mutate(&graph.id, |m| m.repair_leaf_invariant()).unwrap().is_empty());
    }

    #[test]
    fn test_archived_lane_leaves_ignored() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let lane = engine.create_lane(&graph.id, None, None).unwrap();
        engine
            .mutate(&graph.id, |m| m.create_node(NewNode::new("user_message", NodeState::Finished).in_lane(lane.id.clone())))
            .unwrap();
        engine.archive_lane(&graph.id, &lane.id).unwrap();
        assert!(engine.mutate(&graph.id, |m| m.repair_leaf_invariant()).unwrap().is_empty());
    }

    #[test]
    fn test_running_leaf_is_valid() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        engine
            .mutate(&graph.id, |m| m.create_node(NewNode::new("task", NodeState::Pending)))
            .unwrap();
        assert!(engine.mutate(&graph.id, |m| m.repair_leaf_invariant()).unwrap().is_empty());
    }
}
