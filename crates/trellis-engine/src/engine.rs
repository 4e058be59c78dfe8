use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::hooks::EventHooks;
use trellis_core::traits::Policy;
use trellis_core::types::*;
use trellis_store::{GraphRows, SqliteStore};

use crate::context::{AssembledContext, ContextAssembler, ContextRequest};
use crate::mutation::{Fork, Mutator};
use crate::visibility::VisibilityOutcome;

/// Entry point for everything that touches a graph.
///
/// Owns the store, the host policy and the event hooks. Structural changes go
/// through [`GraphEngine::mutate`]; the collected events are dispatched to
/// the hooks only after the transaction commits.
pub struct GraphEngine {
    store: Arc<SqliteStore>,
    policy: Arc<dyn Policy>,
    hooks: EventHooks,
}

impl GraphEngine {
    pub fn new(store: Arc<SqliteStore>, policy: Arc<dyn Policy>, hooks: EventHooks) -> Self {
        Self { store, policy, hooks }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    pub fn hooks(&self) -> &EventHooks {
        &self.hooks
    }

    /// Run `f` as the only mutator of the graph.
    pub fn mutate<T>(&self, graph_id: &GraphId, f: impl FnOnce(&mut Mutator<'_>) -> Result<T>) -> Result<T> {
        let policy = self.policy.as_ref();
        let (out, events) = self.store.with_graph_lock(graph_id, |rows| {
            let mut m = Mutator::new(rows, policy);
            let out = f(&mut m)?;
            Ok((out, m.into_events()))
        })?;
        self.hooks.dispatch(&events);
        Ok(out)
    }

    /// Like [`Self::mutate`] but fails with `LockBusy` instead of waiting.
    pub fn try_mutate<T>(&self, graph_id: &GraphId, f: impl FnOnce(&mut Mutator<'_>) -> Result<T>) -> Result<T> {
        let policy = self.policy.as_ref();
        let (out, events) = self.store.try_with_graph_lock(graph_id, |rows| {
            let mut m = Mutator::new(rows, policy);
            let out = f(&mut m)?;
            Ok((out, m.into_events()))
        })?;
        self.hooks.dispatch(&events);
        Ok(out)
    }

    /// Unlocked read access.
    pub fn read<T>(&self, graph_id: &GraphId, f: impl FnOnce(&GraphRows<'_>) -> Result<T>) -> Result<T> {
        self.store.read(graph_id, f)
    }

    pub fn node(&self, graph_id: &GraphId, node_id: &NodeId) -> Result<Node> {
        self.read(graph_id, |rows| rows.node(node_id))
    }

    // ── Graphs, lanes, turns ────────────────────────────────────────

    /// Create a graph together with its main lane.
    pub fn create_graph(&self, metadata: Map) -> Result<Graph> {
        let graph = self.store.create_graph(metadata)?;
        self.store.with_graph_lock(&graph.id, |rows| {
            rows.insert_lane(&Lane {
                id: LaneId::new(),
                graph_id: graph.id.clone(),
                role: LaneRole::Main,
                name: Some("main".into()),
                parent_lane_id: None,
                forked_from_node_id: None,
                root_node_id: None,
                merged_into_lane_id: None,
                archived_at: None,
                created_at: graph.created_at,
            })
        })?;
        info!(graph_id = %graph.id, "Graph created");
        Ok(graph)
    }

    pub fn destroy_graph(&self, graph_id: &GraphId) -> Result<bool> {
        let destroyed = self.store.destroy_graph(graph_id)?;
        if destroyed {
            info!(graph_id = %graph_id, "Graph destroyed");
        }
        Ok(destroyed)
    }

    pub fn main_lane(&self, graph_id: &GraphId) -> Result<Lane> {
        self.read(graph_id, |rows| {
            rows.main_lane()?
                .ok_or_else(|| TrellisError::not_found("main lane", graph_id))
        })
    }

    /// Create a branch lane under `parent` (the main lane when `None`).
    pub fn create_lane(&self, graph_id: &GraphId, name: Option<String>, parent: Option<&LaneId>) -> Result<Lane> {
        self.mutate(graph_id, |m| {
            let parent = match parent {
                Some(id) => member_lane(m.rows(), id)?,
                None => m
                    .rows()
                    .main_lane()?
                    .ok_or_else(|| TrellisError::not_found("main lane", m.graph_id()))?,
            };
            let lane = branch_lane(m.graph_id(), name, &parent, None);
            m.rows().insert_lane(&lane)?;
            debug!(lane_id = %lane.id, parent = %parent.id, "Lane created");
            Ok(lane)
        })
    }

    /// Branch off `from` into a new lane whose first turn holds the new node.
    pub fn fork_lane(&self, graph_id: &GraphId, from: &NodeId, name: Option<String>, new: NewNode) -> Result<(Lane, Fork)> {
        self.mutate(graph_id, |m| {
            let source = m.member_node(from)?;
            let parent = match &source.lane_id {
                Some(id) => member_lane(m.rows(), id)?,
                None => m
                    .rows()
                    .main_lane()?
                    .ok_or_else(|| TrellisError::not_found("main lane", m.graph_id()))?,
            };
            let lane = branch_lane(m.graph_id(), name, &parent, Some(source.id.clone()));
            m.rows().insert_lane(&lane)?;
            let turn = m.rows().insert_turn(&lane.id, m.now())?;

            let mut new = new;
            new.lane_id = Some(lane.id.clone());
            new.turn_id = Some(turn.id.clone());
            let fork = m.fork_from(&source.id, new)?;
            m.rows().set_lane_root(&lane.id, &fork.node.id)?;
            info!(lane_id = %lane.id, from = %source.id, "Lane forked");
            Ok((m.rows().lane(&lane.id)?, fork))
        })
    }

    pub fn archive_lane(&self, graph_id: &GraphId, lane_id: &LaneId) -> Result<bool> {
        self.mutate(graph_id, |m| {
            let lane = member_lane(m.rows(), lane_id)?;
            if lane.role == LaneRole::Main {
                return Err(TrellisError::Validation("the main lane cannot be archived".into()));
            }
            m.rows().archive_lane(&lane.id, m.now())
        })
    }

    /// Record that `lane_id` was merged into `into` and archive it.
    pub fn merge_lane(&self, graph_id: &GraphId, lane_id: &LaneId, into: &LaneId) -> Result<Lane> {
        self.mutate(graph_id, |m| {
            let lane = member_lane(m.rows(), lane_id)?;
            let target = member_lane(m.rows(), into)?;
            if lane.id == target.id {
                return Err(TrellisError::Validation("a lane cannot merge into itself".into()));
            }
            if lane.role == LaneRole::Main {
                return Err(TrellisError::Validation("the main lane cannot be merged".into()));
            }
            if lane.merged_into_lane_id.is_some() {
                return Err(TrellisError::Validation(format!("lane {} is already merged", lane.id)));
            }
            if target.is_archived() {
                return Err(TrellisError::Validation(format!("lane {} is archived", target.id)));
            }
            m.rows().set_lane_merged(&lane.id, &target.id, m.now())?;
            info!(lane_id = %lane.id, into = %target.id, "Lane merged");
            m.rows().lane(&lane.id)
        })
    }

    /// Open the next turn of a lane. Archived lanes take no new turns.
    pub fn create_turn(&self, graph_id: &GraphId, lane_id: &LaneId) -> Result<Turn> {
        self.mutate(graph_id, |m| {
            let lane = member_lane(m.rows(), lane_id)?;
            if lane.is_archived() {
                return Err(TrellisError::Validation(format!("lane {} is archived", lane.id)));
            }
            let turn = m.rows().insert_turn(&lane.id, m.now())?;
            debug!(turn_id = %turn.id, lane_id = %lane.id, seq = turn.seq, "Turn created");
            Ok(turn)
        })
    }

    // ── Compression and visibility ──────────────────────────────────

    pub fn compress(&self, graph_id: &GraphId, node_ids: &[NodeId], content: &str, metadata: Map) -> Result<Node> {
        self.mutate(graph_id, |m| m.compress(node_ids, content, metadata))
    }

    pub fn request_visibility_change(
        &self,
        graph_id: &GraphId,
        node_id: &NodeId,
        context_excluded: Option<bool>,
        deleted: Option<bool>,
    ) -> Result<VisibilityOutcome> {
        self.mutate(graph_id, |m| m.request_visibility_change(node_id, context_excluded, deleted))
    }

    pub fn apply_visibility_patches(&self, graph_id: &GraphId) -> Result<Vec<NodeId>> {
        self.mutate(graph_id, |m| m.apply_visibility_patches())
    }

    // ── Node events ─────────────────────────────────────────────────

    /// Append to a node's progress stream. Does not take the graph lock.
    pub fn append_node_event(
        &self,
        graph_id: &GraphId,
        node_id: &NodeId,
        kind: NodeEventKind,
        text: &str,
        payload: Value,
    ) -> Result<i64> {
        self.read(graph_id, |rows| {
            rows.find_node(node_id)?
                .ok_or_else(|| TrellisError::not_found("node", node_id))?;
            rows.append_node_event(node_id, kind, text, &payload, Utc::now())
        })
    }

    pub fn node_events(&self, graph_id: &GraphId, node_id: &NodeId) -> Result<Vec<NodeEvent>> {
        self.read(graph_id, |rows| rows.node_events(node_id))
    }

    /// Fold the output deltas of a settled node into one event. Returns the
    /// number of deltas folded.
    pub fn compact_node_events(&self, graph_id: &GraphId, node_id: &NodeId) -> Result<usize> {
        self.mutate(graph_id, |m| {
            let node = m.member_node(node_id)?;
            if !node.state.is_terminal() {
                return Err(TrellisError::InvalidState {
                    node: node.id.0.clone(),
                    actual: node.state.to_string(),
                    expected: "a terminal state".into(),
                });
            }
            let deltas: Vec<NodeEvent> = m
                .rows()
                .node_events(node_id)?
                .into_iter()
                .filter(|e| e.kind == NodeEventKind::OutputDelta)
                .collect();
            if deltas.len() < 2 {
                return Ok(0);
            }
            let text: String = deltas.iter().map(|e| e.text.as_str()).collect();
            m.rows().replace_node_events(node_id, NodeEventKind::OutputDelta, &text, m.now())
        })
    }

    // ── Context ─────────────────────────────────────────────────────

    pub fn assemble(
        &self,
        graph_id: &GraphId,
        assembler: &dyn ContextAssembler,
        request: &ContextRequest,
    ) -> Result<AssembledContext> {
        self.read(graph_id, |rows| assembler.assemble(rows, request))
    }
}

fn member_lane(rows: &GraphRows<'_>, id: &LaneId) -> Result<Lane> {
    rows.find_lane(id)?.ok_or_else(|| {
        TrellisError::CrossGraph(format!("lane {} is not in graph {}", id, rows.graph_id()))
    })
}

fn branch_lane(graph_id: &GraphId, name: Option<String>, parent: &Lane, forked_from: Option<NodeId>) -> Lane {
    Lane {
        id: LaneId::new(),
        graph_id: graph_id.clone(),
        role: LaneRole::Branch,
        name,
        parent_lane_id: Some(parent.id.clone()),
        forked_from_node_id: forked_from,
        root_node_id: None,
        merged_into_lane_id: None,
        archived_at: None,
        created_at: Utc::now(),
    }
}
