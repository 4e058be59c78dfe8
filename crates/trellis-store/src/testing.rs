//! Row builders for store unit tests.

use chrono::Utc;

use trellis_core::error::Result;
use trellis_core::types::*;

use crate::rows::GraphRows;

pub fn finished(graph_id: &GraphId, node_type: &str) -> Node {
    Node {
        id: NodeId::new(),
        graph_id: graph_id.clone(),
        node_type: node_type.into(),
        state: NodeState::Finished,
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

pub fn insert(rows: &GraphRows<'_>, node: Node) -> Result<Node> {
    rows.insert_node(&node)?;
    rows.node(&node.id)
}

pub fn edge(graph_id: &GraphId, from: &NodeId, to: &NodeId, edge_type: EdgeType) -> Edge {
    Edge {
        id: EdgeId::new(),
        graph_id: graph_id.clone(),
        from_node_id: from.clone(),
        to_node_id: to.clone(),
        edge_type,
        metadata: Map::new(),
        compressed_at: None,
        created_at: Utc::now(),
    }
}

pub fn lane(graph_id: &GraphId, role: LaneRole) -> Lane {
    Lane {
        id: LaneId::new(),
        graph_id: graph_id.clone(),
        role,
        name: None,
        parent_lane_id: None,
        forked_from_node_id: None,
        root_node_id: None,
        merged_into_lane_id: None,
        archived_at: None,
        created_at: Utc::now(),
    }
}
