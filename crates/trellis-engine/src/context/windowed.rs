use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_core::config::ContextConfig;
use trellis_core::error::Result;
use trellis_core::types::*;
use trellis_store::GraphRows;

use super::{AncestorClosure, AssembledContext, ContextAssembler, ContextRequest};
use crate::topo::sort_nodes;

/// Selection rules a windowed assembly applied, usable as a live filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextScope {
    pub target: NodeId,
    /// Every turn in scope: the window plus fork cut-points and the
    /// target's own turn.
    pub turn_ids: Vec<TurnId>,
    /// Turns selected by the window alone, newest first.
    pub window_turn_ids: Vec<TurnId>,
    /// The target's lane followed by the lanes it was forked from.
    pub lane_ids: Vec<LaneId>,
    pub pinned_node_types: Vec<String>,
    pub summary_ids: Vec<NodeId>,
}

impl ContextScope {
    pub fn contains(&self, node: &Node) -> bool {
        if node.id == self.target || self.summary_ids.contains(&node.id) {
            return true;
        }
        if node.turn_id.as_ref().is_some_and(|t| self.turn_ids.contains(t)) {
            return true;
        }
        self.pinned_node_types.contains(&node.node_type)
            && node.lane_id.as_ref().is_some_and(|l| self.lane_ids.contains(l))
    }
}

/// Ancestor closure bounded to the most recent turns.
///
/// The window counts `window_turns` anchored turns in total, walking from the
/// target's lane back through the lanes it was forked from. Pinned node
/// types and the newest summaries on that chain are always kept.
#[derive(Debug, Clone)]
pub struct WindowedAssembler {
    pub window_turns: usize,
    pub pinned_node_types: Vec<String>,
    pub recent_summaries: usize,
}

impl WindowedAssembler {
    pub fn new(window_turns: usize) -> Self {
        Self {
            window_turns,
            pinned_node_types: Vec::new(),
            recent_summaries: 0,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            window_turns: config.window_turns,
            pinned_node_types: config.pinned_node_types.clone(),
            recent_summaries: config.recent_summaries,
        }
    }

    /// Same rules with a different window size.
    pub fn with_window(&self, window_turns: usize) -> Self {
        Self {
            window_turns,
            ..self.clone()
        }
    }

    fn scope(&self, rows: &GraphRows<'_>, target: &Node, lane_id: &LaneId) -> Result<ContextScope> {
        let mut lane_ids = Vec::new();
        let mut window = Vec::new();
        let mut forced: Vec<TurnId> = target.turn_id.iter().cloned().collect();

        let mut remaining = self.window_turns;
        let mut next = Some((lane_id.clone(), self.turn_seq(rows, target)?));
        let mut visited = HashSet::new();
        while let Some((lane_id, max_seq)) = next.take() {
            if !visited.insert(lane_id.clone()) {
                break;
            }
            let Some(lane) = rows.find_lane(&lane_id)? else {
                break;
            };
            if remaining > 0 {
                let turns = rows.anchored_turns(&lane.id, max_seq, remaining)?;
                remaining -= turns.len();
                window.extend(turns.into_iter().map(|t| t.id));
            }
            lane_ids.push(lane.id);

            if let Some(fork_id) = &lane.forked_from_node_id {
                if let Some(fork) = rows.find_node(fork_id)? {
                    forced.extend(fork.turn_id.iter().cloned());
                    let parent = fork.lane_id.clone().or(lane.parent_lane_id.clone());
                    let seq = self.turn_seq(rows, &fork)?;
                    next = parent.map(|p| (p, seq));
                }
            }
        }

        let mut summary_ids = Vec::new();
        if self.recent_summaries > 0 {
            summary_ids = rows
                .active_nodes_of_types(&[node_types::SUMMARY.to_string()], &lane_ids)?
                .into_iter()
                .take(self.recent_summaries)
                .map(|n| n.id)
                .collect();
        }

        let mut turn_ids: Vec<TurnId> = window.clone();
        for turn in forced {
            if !turn_ids.contains(&turn) {
                turn_ids.push(turn);
            }
        }

        Ok(ContextScope {
            target: target.id.clone(),
            turn_ids,
            window_turn_ids: window,
            lane_ids,
            pinned_node_types: self.pinned_node_types.clone(),
            summary_ids,
        })
    }

    fn turn_seq(&self, rows: &GraphRows<'_>, node: &Node) -> Result<Option<i64>> {
        match &node.turn_id {
            Some(id) => Ok(rows.find_turn(id)?.map(|t| t.seq)),
            None => Ok(None),
        }
    }
}

impl Default for WindowedAssembler {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl ContextAssembler for WindowedAssembler {
    fn assemble(&self, rows: &GraphRows<'_>, request: &ContextRequest) -> Result<AssembledContext> {
        let target = rows.node(&request.target)?;
        let Some(lane_id) = target.lane_id.clone() else {
            // Nothing to window by.
            return AncestorClosure.assemble(rows, request);
        };
        let scope = self.scope(rows, &target, &lane_id)?;

        let ids = rows.ancestor_ids(&target.id)?;
        let closure = rows.nodes_by_ids(&ids)?;
        let edges = rows.active_blocking_edges_within(&ids)?;
        let sorted = sort_nodes(closure, &edges)?;

        let selected: BTreeSet<&NodeId> = sorted.iter().filter(|n| scope.contains(n)).map(|n| &n.id).collect();
        debug!(
            node_id = %target.id,
            closure = sorted.len(),
            selected = selected.len(),
            window_turns = scope.window_turn_ids.len(),
            "Windowed context assembled"
        );
        let entries = sorted
            .iter()
            .filter(|n| selected.contains(&n.id))
            .filter(|n| request.include_hidden || n.id == request.target || n.is_visible())
            .map(|n| ContextEntry::project(n, request.mode))
            .collect();
        Ok(AssembledContext {
            entries,
            scope: Some(scope),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::GraphEngine;

    fn exchange(engine: &GraphEngine, graph: &GraphId, lane: &LaneId, prev: Option<&NodeId>) -> (TurnId, NodeId, NodeId) {
        crate::testing::exchange(engine, graph, lane, prev, 3)
    }

    fn assembler(n: usize) -> WindowedAssembler {
        WindowedAssembler {
            window_turns: n,
            pinned_node_types: vec!["system_message".into()],
            recent_summaries: 1,
        }
    }

    #[test]
    fn test_window_keeps_recent_turns_and_pinned() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let main = engine.main_lane(&graph.id).unwrap();
        let system = engine
            .mutate(&graph.id, |m| m.create_node(NewNode::new("system_message", NodeState::Finished).in_lane(main.id.clone())))
            .unwrap();

        let mut prev = system.id.clone();
        let mut turns = Vec::new();
        for _ in 0..4 {
            let (turn, user, agent) = exchange(&engine, &graph.id, &main.id, Some(&prev));
            turns.push((turn, user, agent.clone()));
            prev = agent;
        }

        let ctx = engine
            .assemble(&graph.id, &assembler(2), &ContextRequest::new(prev.clone()))
            .unwrap();
        let ids = ctx.node_ids();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], &system.id);
        assert_eq!(ids[1], &turns[2].1);
        assert_eq!(ids[4], &turns[3].2);
        let scope = ctx.scope.unwrap();
        assert_eq!(scope.window_turn_ids, vec![turns[3].0.clone(), turns[2].0.clone()]);

        // A wide window covers the whole closure.
        let all = engine
            .assemble(&graph.id, &assembler(10), &ContextRequest::new(prev.clone()))
            .unwrap();
        let closure = engine
            .assemble(&graph.id, &AncestorClosure, &ContextRequest::new(prev))
            .unwrap();
        assert_eq!(all.node_ids(), closure.node_ids());
    }

    #[test]
    fn test_window_walks_fork_chain() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let main = engine.main_lane(&graph.id).unwrap();
        let (_, u1, a1) = exchange(&engine, &graph.id, &main.id, None);
        let (t2, u2, a2) = exchange(&engine, &graph.id, &main.id, Some(&a1));
        // Later main-lane turns are not ancestors of the branch.
        exchange(&engine, &graph.id, &main.id, Some(&a2));

        let (lane, fork) = engine
            .fork_lane(&graph.id, &a2, Some("alt".into()), NewNode::new("user_message", NodeState::Finished))
            .unwrap();
        let (_, bu, ba) = exchange(&engine, &graph.id, &lane.id, Some(&fork.node.id));

        let ctx = engine
            .assemble(&graph.id, &assembler(2), &ContextRequest::new(ba.clone()))
            .unwrap();
        let scope = ctx.scope.clone().unwrap();
        assert_eq!(scope.lane_ids, vec![lane.id.clone(), main.id.clone()]);
        // Two branch turns fill the window; the fork cut-point turn is forced in.
        assert_eq!(scope.window_turn_ids.len(), 2);
        assert!(scope.turn_ids.contains(&t2));
        assert!(!ctx.contains(&u1));
        assert!(!ctx.contains(&a1));
        assert_eq!(ctx.node_ids(), vec![&u2, &a2, &fork.node.id, &bu, &ba]);

        // With room to spare the window reaches back into the parent lane.
        let ctx = engine
            .assemble(&graph.id, &assembler(4), &ContextRequest::new(ba))
            .unwrap();
        assert!(ctx.contains(&u1));
    }

    #[test]
    fn test_recent_summaries_kept() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let main = engine.main_lane(&graph.id).unwrap();
        let (_, u1, a1) = exchange(&engine, &graph.id, &main.id, None);
        let (_, _, a2) = exchange(&engine, &graph.id, &main.id, Some(&a1));
        let (_, _, a3) = exchange(&engine, &graph.id, &main.id, Some(&a2));
        let summary = engine.compress(&graph.id, &[u1, a1], "first exchange", Map::new()).unwrap();

        let ctx = engine
            .assemble(&graph.id, &assembler(1), &ContextRequest::new(a3))
            .unwrap();
        assert!(ctx.contains(&summary.id));
        assert!(!ctx.contains(&a2));
        assert_eq!(ctx.entries[0].node_id, summary.id);
    }

    #[test]
    fn test_laneless_target_falls_back_to_closure() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message", "agent_message"]);
        let ctx = engine
            .assemble(&graph.id, &assembler(1), &ContextRequest::new(ids[1].clone()))
            .unwrap();
        assert_eq!(ctx.entries.len(), 2);
        assert!(ctx.scope.is_none());
    }
}
