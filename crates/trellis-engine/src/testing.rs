//! Fixtures for engine unit tests.

use std::sync::{Arc, Mutex};

use serde_json::json;

use trellis_core::error::Result;
use trellis_core::hooks::EventHooks;
use trellis_core::policy::DefaultPolicy;
use trellis_core::traits::EventSink;
use trellis_core::types::*;
use trellis_store::SqliteStore;

use crate::GraphEngine;

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GraphEvent>>,
}

impl RecordingSink {
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn record_event(&self, event: &GraphEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub fn engine() -> Arc<GraphEngine> {
    engine_with_sink().0
}

pub fn engine_with_sink() -> (Arc<GraphEngine>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = GraphEngine::new(
        Arc::new(SqliteStore::in_memory().unwrap()),
        Arc::new(DefaultPolicy::default()),
        EventHooks::new().with_sink(sink.clone()),
    );
    (Arc::new(engine), sink)
}

/// Finished nodes of the given types linked by sequence edges, outside any
/// lane.
pub fn chain(engine: &GraphEngine, graph: &GraphId, types: &[&str]) -> Vec<NodeId> {
    engine
        .mutate(graph, |m| {
            let mut ids: Vec<NodeId> = Vec::new();
            for node_type in types {
                let node = m.create_node(NewNode::new(*node_type, NodeState::Finished))?;
                if let Some(prev) = ids.last() {
                    m.create_edge(NewEdge::sequence(prev.clone(), node.id.clone()))?;
                }
                ids.push(node.id);
            }
            Ok(ids)
        })
        .unwrap()
}

/// A finished user/agent exchange in a new turn of `lane`, following `prev`.
pub fn exchange(
    engine: &GraphEngine,
    graph: &GraphId,
    lane: &LaneId,
    prev: Option<&NodeId>,
    words: usize,
) -> (TurnId, NodeId, NodeId) {
    let turn = engine.create_turn(graph, lane).unwrap();
    engine
        .mutate(graph, |m| {
            let text = "word ".repeat(words);
            let mut output = Map::new();
            output.insert("content".into(), json!(text));
            let user = m.create_node(
                NewNode::new(node_types::USER_MESSAGE, NodeState::Finished)
                    .in_turn(turn.id.clone())
                    .with_content(text.clone()),
            )?;
            let agent = m.create_node(
                NewNode::new(node_types::AGENT_MESSAGE, NodeState::Finished)
                    .in_turn(turn.id.clone())
                    .with_output(output),
            )?;
            if let Some(prev) = prev {
                m.create_edge(NewEdge::sequence(prev.clone(), user.id.clone()))?;
            }
            m.create_edge(NewEdge::sequence(user.id.clone(), agent.id.clone()))?;
            Ok((turn.id.clone(), user.id, agent.id))
        })
        .unwrap()
}

/// `turns` chained exchanges on the main lane.
pub fn conversation(engine: &GraphEngine, graph: &GraphId, turns: usize, words: usize) -> Vec<(TurnId, NodeId, NodeId)> {
    let main = engine.main_lane(graph).unwrap();
    let mut out: Vec<(TurnId, NodeId, NodeId)> = Vec::new();
    for _ in 0..turns {
        let prev = out.last().map(|(_, _, agent)| agent.clone());
        out.push(exchange(engine, graph, &main.id, prev.as_ref(), words));
    }
    out
}

/// A finished task with `content` as output, in the same turn as `after`.
pub fn tool_output(engine: &GraphEngine, graph: &GraphId, after: &NodeId, content: &str) -> NodeId {
    let prev = engine.node(graph, after).unwrap();
    engine
        .mutate(graph, |m| {
            let mut output = Map::new();
            output.insert("content".into(), json!(content));
            let mut new = NewNode::new(node_types::TASK, NodeState::Finished).with_output(output);
            new.lane_id = prev.lane_id.clone();
            new.turn_id = prev.turn_id.clone();
            let task = m.create_node(new)?;
            m.create_edge(NewEdge::dependency(after.clone(), task.id.clone()))?;
            Ok(task.id)
        })
        .unwrap()
}
