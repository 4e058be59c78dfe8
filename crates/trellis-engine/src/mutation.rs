//! Transactional, idempotent graph mutation.
//!
//! A [`Mutator`] only exists inside [`GraphEngine::mutate`](crate::GraphEngine::mutate),
//! so every method here runs under the graph lock and inside one
//! transaction. Events are buffered and dispatched after commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use trellis_core::body::NodeBody;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::Policy;
use trellis_core::types::*;
use trellis_store::GraphRows;

/// Outcome of [`Mutator::fork_from`].
#[derive(Debug, Clone)]
pub struct Fork {
    pub node: Node,
    pub sequence_edge: Edge,
    pub branch_edge: Edge,
}

pub struct Mutator<'a> {
    rows: &'a GraphRows<'a>,
    policy: &'a dyn Policy,
    events: Vec<GraphEvent>,
    now: DateTime<Utc>,
}

impl<'a> Mutator<'a> {
    pub fn new(rows: &'a GraphRows<'a>, policy: &'a dyn Policy) -> Self {
        Self {
            rows,
            policy,
            events: Vec::new(),
            now: Utc::now(),
        }
    }

    pub fn rows(&self) -> &GraphRows<'a> {
        self.rows
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy
    }

    pub fn graph_id(&self) -> &GraphId {
        self.rows.graph_id()
    }

    /// Timestamp shared by every change in this batch.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn emit(&mut self, event_type: EventType, subject_type: SubjectType, subject_id: impl std::fmt::Display, particulars: Value) {
        let mut event = GraphEvent::new(self.rows.graph_id(), event_type, subject_type, subject_id, particulars);
        event.occurred_at = self.now;
        self.events.push(event);
    }

    pub fn events(&self) -> &[GraphEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<GraphEvent> {
        self.events
    }

    /// A node of this graph. Ids from other graphs are rejected.
    pub fn member_node(&self, id: &NodeId) -> Result<Node> {
        self.rows.find_node(id)?.ok_or_else(|| {
            TrellisError::CrossGraph(format!("node {} is not in graph {}", id, self.graph_id()))
        })
    }

    fn body_for(&self, node_type: &str) -> Result<Arc<dyn NodeBody>> {
        self.policy.body_for_node_type(node_type).ok_or_else(|| {
            TrellisError::Validation(format!("no body registered for node type '{}'", node_type))
        })
    }

    // ── Nodes ───────────────────────────────────────────────────────

    /// Create a node. With an idempotency key, a repeat request returns the
    /// existing node provided its state and payload match exactly.
    pub fn create_node(&mut self, new: NewNode) -> Result<Node> {
        let body = self.body_for(&new.node_type)?;

        let mut lane_id = new.lane_id.clone();
        if let Some(turn_id) = &new.turn_id {
            let turn = self.rows.find_turn(turn_id)?.ok_or_else(|| {
                TrellisError::CrossGraph(format!("turn {} is not in graph {}", turn_id, self.graph_id()))
            })?;
            match &lane_id {
                Some(lane) if *lane != turn.lane_id => {
                    return Err(TrellisError::Validation(format!(
                        "turn {} belongs to lane {}, not {}",
                        turn_id, turn.lane_id, lane
                    )))
                }
                Some(_) => {}
                None => lane_id = Some(turn.lane_id.clone()),
            }
        }
        if let Some(lane) = &lane_id {
            if self.rows.find_lane(lane)?.is_none() {
                return Err(TrellisError::CrossGraph(format!(
                    "lane {} is not in graph {}",
                    lane,
                    self.graph_id()
                )));
            }
        }

        if let Some(key) = &new.idempotency_key {
            if let Some(existing) =
                self.rows
                    .find_by_idempotency_key(new.turn_id.as_ref(), &new.node_type, key)?
            {
                ensure_same_intent(&existing, &new, key)?;
                debug!(node_id = %existing.id, key = %key, "Idempotent node create hit existing row");
                return Ok(existing);
            }
        }

        let node = Node {
            id: NodeId::new(),
            graph_id: self.graph_id().clone(),
            node_type: new.node_type.clone(),
            state: new.state,
            body_kind: body.kind().to_string(),
            output_preview: body.output_preview(&new.output),
            input: new.input.clone(),
            output: new.output.clone(),
            metadata: new.metadata.clone(),
            lane_id,
            turn_id: new.turn_id.clone(),
            idempotency_key: new.idempotency_key.clone(),
            retry_of_id: new.retry_of_id.clone(),
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
            created_at: self.now,
        };

        let conn = self.rows.conn();
        conn.execute_batch("SAVEPOINT create_node")
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let inserted = match self.rows.insert_node(&node) {
            Ok(inserted) => inserted,
            Err(e) => {
                conn.execute_batch("ROLLBACK TO create_node; RELEASE create_node").ok();
                return Err(e);
            }
        };
        if !inserted {
            // Lost the race on the idempotency key: the winner's row stands.
            conn.execute_batch("ROLLBACK TO create_node; RELEASE create_node")
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let key = new.idempotency_key.clone().unwrap_or_default();
            let winner = self
                .rows
                .find_by_idempotency_key(new.turn_id.as_ref(), &new.node_type, &key)?
                .ok_or_else(|| {
                    TrellisError::Database(format!("node insert rejected without a conflicting row ({})", key))
                })?;
            ensure_same_intent(&winner, &new, &key)?;
            return Ok(winner);
        }
        conn.execute_batch("RELEASE create_node")
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        if let Some(turn_id) = &node.turn_id {
            self.rows.anchor_turn(turn_id, &node.id)?;
        }

        debug!(graph_id = %node.graph_id, node_id = %node.id, node_type = %node.node_type, "Node created");
        self.emit(
            EventType::NodeCreated,
            SubjectType::Node,
            &node.id,
            json!({
                "node_type": node.node_type,
                "state": node.state,
                "lane_id": node.lane_id,
                "turn_id": node.turn_id,
            }),
        );
        self.rows.node(&node.id)
    }

    // ── Edges ───────────────────────────────────────────────────────

    /// Create an edge, idempotent on `(from, to, type)`. Blocking edges must
    /// not close a cycle among active blocking edges.
    pub fn create_edge(&mut self, new: NewEdge) -> Result<Edge> {
        let from = self.member_node(&new.from)?;
        let to = self.member_node(&new.to)?;

        if let Some(existing) = self.rows.find_edge(&from.id, &to.id, new.edge_type)? {
            if existing.is_active() {
                return Ok(existing);
            }
            return Err(TrellisError::ArchivedEdge(existing.id.0));
        }

        if new.edge_type.is_blocking() {
            if from.id == to.id || self.rows.reaches(&to.id, &from.id)? {
                return Err(TrellisError::CycleDetected {
                    from: from.id.0,
                    to: to.id.0,
                });
            }
            if !from.is_active() || !to.is_active() {
                return Err(TrellisError::Validation(format!(
                    "blocking edge {} -> {} touches an archived node",
                    from.id, to.id
                )));
            }
        } else if from.id == to.id {
            return Err(TrellisError::Validation(format!("self edge on {}", from.id)));
        }

        let edge = Edge {
            id: EdgeId::new(),
            graph_id: self.graph_id().clone(),
            from_node_id: from.id,
            to_node_id: to.id,
            edge_type: new.edge_type,
            metadata: new.metadata,
            compressed_at: None,
            created_at: self.now,
        };
        self.rows.insert_edge(&edge)?;
        debug!(edge_id = %edge.id, from = %edge.from_node_id, to = %edge.to_node_id, edge_type = %edge.edge_type, "Edge created");
        self.emit(
            EventType::EdgeCreated,
            SubjectType::Edge,
            &edge.id,
            json!({
                "from_node_id": edge.from_node_id,
                "to_node_id": edge.to_node_id,
                "edge_type": edge.edge_type,
            }),
        );
        Ok(edge)
    }

    // ── Replacement ─────────────────────────────────────────────────

    /// Start a branch from a settled node: the new node follows `from` by a
    /// sequence edge and records the fork with a branch edge.
    pub fn fork_from(&mut self, from: &NodeId, new: NewNode) -> Result<Fork> {
        let source = self.member_node(from)?;
        if !source.is_active() {
            return Err(TrellisError::Validation(format!("cannot fork from archived node {}", from)));
        }
        require_state(&source, &NodeState::TERMINAL)?;

        let node = self.create_node(new)?;
        let sequence_edge = self.create_edge(NewEdge::sequence(source.id.clone(), node.id.clone()))?;
        let branch_edge = self.create_edge(
            NewEdge::new(source.id.clone(), node.id.clone(), EdgeType::Branch)
                .with_metadata(branch_kinds("fork")),
        )?;
        Ok(Fork {
            node,
            sequence_edge,
            branch_edge,
        })
    }

    /// Replace a failed node with a fresh pending attempt that takes over its
    /// place in the graph.
    pub fn retry_replace(&mut self, id: &NodeId) -> Result<Node> {
        let old = self.active_member(id)?;
        let body = self.body_for(&old.node_type)?;
        if !body.retriable() {
            return Err(TrellisError::Validation(format!("node type '{}' is not retriable", old.node_type)));
        }
        require_state(&old, &[NodeState::Errored, NodeState::Rejected, NodeState::Cancelled])?;

        let descendants = self.rows.nodes_by_ids(&self.rows.descendant_ids(&old.id)?)?;
        if let Some(busy) = descendants.iter().find(|d| d.state != NodeState::Pending) {
            return Err(TrellisError::Validation(format!(
                "cannot retry {}: descendant {} is {}",
                old.id, busy.id, busy.state
            )));
        }

        let mut new = replacement(&old, NodeState::Pending);
        new.input = body.retry_input(&old.input);
        new.retry_of_id = Some(old.id.clone());
        let replacement = self.replace_with(&old, new, "retry", true)?;
        Ok(replacement)
    }

    /// Replace a finished leaf with a fresh pending attempt.
    pub fn regenerate_replace(&mut self, id: &NodeId) -> Result<Node> {
        let old = self.active_member(id)?;
        let body = self.body_for(&old.node_type)?;
        if !body.regeneratable() {
            return Err(TrellisError::Validation(format!(
                "node type '{}' is not regeneratable",
                old.node_type
            )));
        }
        require_state(&old, &[NodeState::Finished])?;
        if self.rows.active_outgoing(&old.id)?.iter().any(|e| e.is_blocking()) {
            return Err(TrellisError::Validation(format!("cannot regenerate {}: not a leaf", old.id)));
        }

        let mut new = replacement(&old, NodeState::Pending);
        new.retry_of_id = Some(old.id.clone());
        self.replace_with(&old, new, "regenerate", false)
    }

    /// Replace a finished node with an edited copy. Everything downstream of
    /// the original is archived with it.
    pub fn edit_replace(&mut self, id: &NodeId, input: Map) -> Result<Node> {
        let old = self.active_member(id)?;
        let body = self.body_for(&old.node_type)?;
        if !body.editable() {
            return Err(TrellisError::Validation(format!("node type '{}' is not editable", old.node_type)));
        }
        require_state(&old, &[NodeState::Finished])?;

        let descendant_ids = self.rows.descendant_ids(&old.id)?;
        let descendants = self.rows.nodes_by_ids(&descendant_ids)?;
        if let Some(busy) = descendants
            .iter()
            .find(|d| matches!(d.state, NodeState::Pending | NodeState::Running))
        {
            return Err(TrellisError::Validation(format!(
                "cannot edit {}: descendant {} is {}",
                old.id, busy.id, busy.state
            )));
        }

        let mut merged = Value::Object(old.input.clone());
        deep_merge(&mut merged, Value::Object(input));
        let mut new = replacement(&old, NodeState::Finished);
        new.input = match merged {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        new.output = old.output.clone();

        let node = self.replace_with(&old, new, "edit", false)?;

        let mut doomed = descendant_ids;
        doomed.sort();
        let edges: Vec<EdgeId> = self
            .rows
            .active_edges_touching(&doomed)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        self.rows.archive_edges(&edges, self.now)?;
        self.rows.archive_nodes(&doomed, self.now, Some(&node.id))?;
        debug!(node_id = %old.id, archived = doomed.len(), "Edit archived downstream nodes");
        Ok(node)
    }

    fn active_member(&self, id: &NodeId) -> Result<Node> {
        let node = self.member_node(id)?;
        if !node.is_active() {
            return Err(TrellisError::Validation(format!("node {} is archived", id)));
        }
        Ok(node)
    }

    /// Shared replacement pattern: create the replacement, copy incoming
    /// blocking edges (and outgoing ones when `keep_outgoing`), link old to
    /// new with a branch edge, then archive the old node and its incident
    /// edges attributing the archival to the replacement.
    fn replace_with(&mut self, old: &Node, new: NewNode, kind: &str, keep_outgoing: bool) -> Result<Node> {
        let incident = self.rows.active_edges_touching(std::slice::from_ref(&old.id))?;
        let node = self.create_node(new)?;

        for edge in incident.iter().filter(|e| e.is_blocking()) {
            if edge.to_node_id == old.id {
                self.create_edge(
                    NewEdge::new(edge.from_node_id.clone(), node.id.clone(), edge.edge_type)
                        .with_metadata(edge.metadata.clone()),
                )?;
            } else if keep_outgoing {
                self.create_edge(
                    NewEdge::new(node.id.clone(), edge.to_node_id.clone(), edge.edge_type)
                        .with_metadata(edge.metadata.clone()),
                )?;
            }
        }
        self.create_edge(
            NewEdge::new(old.id.clone(), node.id.clone(), EdgeType::Branch).with_metadata(branch_kinds(kind)),
        )?;

        let incident_ids: Vec<EdgeId> = incident.into_iter().map(|e| e.id).collect();
        self.rows.archive_edges(&incident_ids, self.now)?;
        self.rows.archive_nodes(std::slice::from_ref(&old.id), self.now, Some(&node.id))?;
        self.rows.reanchor_turns(&old.id, &node.id)?;

        self.emit(
            EventType::NodeReplaced,
            SubjectType::Node,
            &node.id,
            json!({
                "kind": kind,
                "replaced_node_id": old.id,
                "replacement_node_id": node.id,
                "archived_edge_ids": incident_ids,
            }),
        );
        Ok(node)
    }
}

fn require_state(node: &Node, allowed: &[NodeState]) -> Result<()> {
    if allowed.contains(&node.state) {
        return Ok(());
    }
    Err(TrellisError::InvalidState {
        node: node.id.0.clone(),
        actual: node.state.to_string(),
        expected: allowed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn ensure_same_intent(existing: &Node, new: &NewNode, key: &str) -> Result<()> {
    if existing.state == new.state && existing.input == new.input && existing.output == new.output {
        Ok(())
    } else {
        Err(TrellisError::IdempotencyConflict { key: key.to_string() })
    }
}

fn replacement(old: &Node, state: NodeState) -> NewNode {
    let mut new = NewNode::new(old.node_type.clone(), state).with_metadata(old.metadata.clone());
    new.input = old.input.clone();
    new.lane_id = old.lane_id.clone();
    new.turn_id = old.turn_id.clone();
    new
}

pub(crate) fn branch_kinds(kind: &str) -> Map {
    let mut metadata = Map::new();
    metadata.insert("branch_kinds".into(), json!([kind]));
    metadata
}

/// Recursively merge `patch` into `base`. Objects merge key by key; any
/// other value replaces.
pub fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                match base.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Sorted, de-duplicated node ids.
pub(crate) fn unique_ids(ids: &[NodeId]) -> Vec<NodeId> {
    ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}
