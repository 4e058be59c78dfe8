//! Collapse a finished node set into one summary node.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{json, Value};
use tracing::info;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;

use crate::mutation::{unique_ids, Mutator};

impl<'a> Mutator<'a> {
    /// Replace `node_ids` with a finished summary node.
    ///
    /// Boundary edges are rewired through the summary, one new edge per
    /// `(external node, edge type)` group. The originals and every edge that
    /// touched them are archived with the summary as `compressed_by_id`.
    pub fn compress(&mut self, node_ids: &[NodeId], content: &str, metadata: Map) -> Result<Node> {
        let ids = unique_ids(node_ids);
        if ids.is_empty() {
            return Err(TrellisError::Validation("nothing to compress".into()));
        }
        let nodes = self.rows().nodes_by_ids(&ids)?;
        if nodes.len() != ids.len() {
            let found: HashSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
            let missing: Vec<&str> = ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(|id| id.as_str())
                .collect();
            return Err(TrellisError::CrossGraph(format!(
                "nodes not in graph {}: {}",
                self.graph_id(),
                missing.join(", ")
            )));
        }
        if let Some(archived) = nodes.iter().find(|n| !n.is_active()) {
            return Err(TrellisError::Validation(format!("node {} is already compressed", archived.id)));
        }
        if let Some(unfinished) = nodes.iter().find(|n| n.state != NodeState::Finished) {
            return Err(TrellisError::InvalidState {
                node: unfinished.id.0.clone(),
                actual: unfinished.state.to_string(),
                expected: NodeState::Finished.to_string(),
            });
        }

        let members: HashSet<&NodeId> = ids.iter().collect();
        let touched = self.rows().active_edges_touching(&ids)?;
        let mut incoming: BTreeMap<(NodeId, EdgeType), Vec<&Edge>> = BTreeMap::new();
        let mut outgoing: BTreeMap<(NodeId, EdgeType), Vec<&Edge>> = BTreeMap::new();
        for edge in &touched {
            match (members.contains(&edge.from_node_id), members.contains(&edge.to_node_id)) {
                (false, true) => incoming
                    .entry((edge.from_node_id.clone(), edge.edge_type))
                    .or_default()
                    .push(edge),
                (true, false) => outgoing
                    .entry((edge.to_node_id.clone(), edge.edge_type))
                    .or_default()
                    .push(edge),
                _ => {}
            }
        }
        if !outgoing.keys().any(|(_, edge_type)| edge_type.is_blocking()) {
            return Err(TrellisError::Validation(
                "compressed set has no outgoing blocking edge; the summary would be a dangling leaf".into(),
            ));
        }

        // The newest member decides where the summary lives.
        let newest = nodes.iter().max_by_key(|n| (&n.created_at, &n.id));
        let mut summary_metadata = metadata;
        summary_metadata.insert("replaces_node_ids".into(), json!(ids));
        let mut output = Map::new();
        output.insert("content".into(), Value::String(content.to_string()));
        let mut new = NewNode::new(node_types::SUMMARY, NodeState::Finished)
            .with_output(output)
            .with_metadata(summary_metadata);
        new.lane_id = newest.and_then(|n| n.lane_id.clone());
        let summary = self.create_node(new)?;

        let archived_edges: Vec<EdgeId> = touched.iter().map(|e| e.id.clone()).collect();
        self.rows().archive_edges(&archived_edges, self.now())?;
        self.rows().archive_nodes(&ids, self.now(), Some(&summary.id))?;

        let mut created = Vec::new();
        for ((source, edge_type), group) in &incoming {
            let edge = self.create_edge(
                NewEdge::new(source.clone(), summary.id.clone(), *edge_type).with_metadata(merge_group_metadata(group)),
            )?;
            created.push(edge.id);
        }
        for ((target, edge_type), group) in &outgoing {
            let edge = self.create_edge(
                NewEdge::new(summary.id.clone(), target.clone(), *edge_type).with_metadata(merge_group_metadata(group)),
            )?;
            created.push(edge.id);
        }

        info!(
            graph_id = %self.graph_id(),
            summary_id = %summary.id,
            nodes = ids.len(),
            archived_edges = archived_edges.len(),
            rewired_edges = created.len(),
            "Subgraph compressed"
        );
        self.emit(
            EventType::SubgraphCompressed,
            SubjectType::Node,
            &summary.id,
            json!({
                "replaces_node_ids": ids,
                "archived_edge_ids": archived_edges,
                "created_edge_ids": created,
            }),
        );
        self.rows().node(&summary.id)
    }
}

/// Metadata for a rewired edge: keys every member agrees on, the union of
/// branch kinds for branch edges, and the ids of the edges it replaces.
fn merge_group_metadata(group: &[&Edge]) -> Map {
    let mut merged = Map::new();
    if let Some((first, rest)) = group.split_first() {
        for (key, value) in &first.metadata {
            if rest.iter().all(|e| e.metadata.get(key) == Some(value)) {
                merged.insert(key.clone(), value.clone());
            }
        }
        if first.edge_type == EdgeType::Branch {
            let kinds: BTreeSet<String> = group
                .iter()
                .filter_map(|e| e.metadata.get("branch_kinds").and_then(|k| k.as_array()))
                .flatten()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect();
            merged.insert("branch_kinds".into(), json!(kinds));
        }
    }
    let mut replaced: Vec<&str> = group.iter().map(|e| e.id.as_str()).collect();
    replaced.sort();
    merged.insert("replaces_edge_ids".into(), json!(replaced));
    merged
}
