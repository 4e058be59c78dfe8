//! Failure propagation along dependency edges.

use serde_json::json;
use tracing::{debug, info};

use trellis_core::error::Result;
use trellis_core::types::*;
use trellis_store::Transition;

use crate::mutation::Mutator;

impl<'a> Mutator<'a> {
    /// Skip every pending executable node with a failed dependency
    /// predecessor, repeating until nothing changes so the skip cascades
    /// down dependency chains. Sequence edges never propagate failure.
    ///
    /// Returns the skipped node ids in the order they were skipped.
    pub fn propagate_failures(&mut self) -> Result<Vec<NodeId>> {
        let mut skipped = Vec::new();
        loop {
            let blocked: Vec<(NodeId, Vec<NodeId>)> = self
                .rows()
                .pending_blocked_by_failures()?
                .into_iter()
                .filter(|(_, node_type, _)| self.policy().is_executable(node_type))
                .map(|(id, _, preds)| (id, preds))
                .collect();
            if blocked.is_empty() {
                break;
            }

            let mut progressed = false;
            for (id, preds) in blocked {
                let node = self.rows().node(&id)?;
                let mut metadata = node.metadata.clone();
                metadata.insert("blocked_by".into(), json!(preds));
                let reason = format!("blocked by failed dependency {}", preds[0]);
                let change = Transition::at(self.now())
                    .with_error(&reason)
                    .with_metadata(&metadata);
                if !self
                    .rows()
                    .transition(&id, &[NodeState::Pending], NodeState::Skipped, &change)?
                {
                    continue;
                }
                debug!(node_id = %id, blocked_by = ?preds, "Pending node skipped");
                self.emit(
                    EventType::NodeStateChanged,
                    SubjectType::Node,
                    &id,
                    json!({
                        "from": NodeState::Pending,
                        "to": NodeState::Skipped,
                        "blocked_by": preds,
                    }),
                );
                skipped.push(id);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        if !skipped.is_empty() {
            info!(graph_id = %self.graph_id(), count = skipped.len(), "Failure propagated");
        }
        Ok(skipped)
    }
}
