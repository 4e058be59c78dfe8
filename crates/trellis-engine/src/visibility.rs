//! Deferred visibility changes.
//!
//! Excluding a node from context or soft-deleting it must not race with
//! execution, so a change only lands when the node is terminal and nothing in
//! the graph is running. Otherwise it is queued as a patch (one per node) and
//! applied by a later sweep.

use serde_json::json;
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;

use crate::mutation::Mutator;

#[derive(Debug, Clone)]
pub enum VisibilityOutcome {
    Applied(Node),
    Queued(VisibilityPatch),
}

impl VisibilityOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

impl<'a> Mutator<'a> {
    fn graph_idle(&self) -> Result<bool> {
        Ok(self.rows().count_in_state(NodeState::Running)? == 0)
    }

    pub fn request_visibility_change(
        &mut self,
        node_id: &NodeId,
        context_excluded: Option<bool>,
        deleted: Option<bool>,
    ) -> Result<VisibilityOutcome> {
        if context_excluded.is_none() && deleted.is_none() {
            return Err(TrellisError::Validation("visibility change requests no flag".into()));
        }
        let node = self.member_node(node_id)?;

        // Merge with anything already queued so the newest request wins per flag.
        let patch = self.rows().upsert_patch(&node.id, context_excluded, deleted, self.now())?;
        if node.state.is_terminal() && self.graph_idle()? {
            let node = self.apply_patch(&patch)?;
            return Ok(VisibilityOutcome::Applied(node));
        }
        debug!(node_id = %node.id, state = %node.state, "Visibility change queued");
        Ok(VisibilityOutcome::Queued(patch))
    }

    /// Apply every patch whose node is terminal, provided no node in the graph
    /// is running. Patches for nodes that no longer exist are dropped.
    pub fn apply_visibility_patches(&mut self) -> Result<Vec<NodeId>> {
        let patches = self.rows().patches()?;
        if patches.is_empty() || !self.graph_idle()? {
            return Ok(Vec::new());
        }
        let mut applied = Vec::new();
        for patch in patches {
            match self.rows().find_node(&patch.node_id)? {
                Some(node) if node.state.is_terminal() => {
                    self.apply_patch(&patch)?;
                    applied.push(patch.node_id);
                }
                Some(_) => {}
                None => self.rows().delete_patch(&patch.node_id)?,
            }
        }
        if !applied.is_empty() {
            info!(graph_id = %self.graph_id(), count = applied.len(), "Visibility patches applied");
        }
        Ok(applied)
    }

    fn apply_patch(&mut self, patch: &VisibilityPatch) -> Result<Node> {
        self.rows()
            .set_visibility(&patch.node_id, patch.context_excluded, patch.deleted, self.now())?;
        self.rows().delete_patch(&patch.node_id)?;
        self.emit(
            EventType::NodeVisibilityChanged,
            SubjectType::Node,
            &patch.node_id,
            json!({
                "context_excluded": patch.context_excluded,
                "deleted": patch.deleted,
            }),
        );
        self.rows().node(&patch.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_applies_immediately_when_idle() {
        let (engine, sink) = engine_with_sink();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message"]);

        let outcome = engine
            .request_visibility_change(&graph.id, &ids[0], Some(true), None)
            .unwrap();
        match outcome {
            VisibilityOutcome::Applied(node) => assert!(node.context_excluded_at.is_some()),
            other => panic!("expected applied, got {:?}", other),
        }
        assert_eq!(sink.count(EventType::NodeVisibilityChanged), 1);
        assert!(engine.read(&graph.id, |rows| rows.patches()).unwrap().is_empty());
    }

    #[test]
    fn test_queued_while_running_then_swept() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message"]);
        let running = engine
            .mutate(&graph.id, |m| m.create_node(NewNode::new("task", NodeState::Pending)))
            .unwrap();
        let now = Utc::now();
        engine
            .read(&graph.id, |rows| rows.claim(&running.id, "w", now, now + Duration::seconds(60)))
            .unwrap();

        let outcome = engine
            .request_visibility_change(&graph.id, &ids[0], None, Some(true))
            .unwrap();
        assert!(!outcome.is_applied());
        // A second request merges into the same patch.
        engine
            .request_visibility_change(&graph.id, &ids[0], Some(true), None)
            .unwrap();
        assert_eq!(engine.read(&graph.id, |rows| rows.patches()).unwrap().len(), 1);
        assert!(engine.apply_visibility_patches(&graph.id).unwrap().is_empty());

        engine
            .mutate(&graph.id, |m| {
                m.rows().transition(
                    &running.id,
                    &[NodeState::Running],
                    NodeState::Finished,
                    &trellis_store::Transition::at(m.now()),
                )
            })
            .unwrap();
        let applied = engine.apply_visibility_patches(&graph.id).unwrap();
        assert_eq!(applied, vec![ids[0].clone()]);
        let node = engine.node(&graph.id, &ids[0]).unwrap();
        assert!(node.deleted_at.is_some());
        assert!(node.context_excluded_at.is_some());
    }

    #[test]
    fn test_pending_target_waits() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let pending = engine
            .mutate(&graph.id, |m| m.create_node(NewNode::new("task", NodeState::Pending)))
            .unwrap();
        let outcome = engine
            .request_visibility_change(&graph.id, &pending.id, Some(true), None)
            .unwrap();
        assert!(!outcome.is_applied());
        assert!(engine.apply_visibility_patches(&graph.id).unwrap().is_empty());
    }
}
