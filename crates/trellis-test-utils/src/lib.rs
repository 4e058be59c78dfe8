//! Fixtures shared by the workspace's integration tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::json;

use trellis_core::config::AppConfig;
use trellis_core::error::Result;
use trellis_core::hooks::EventHooks;
use trellis_core::policy::DefaultPolicy;
use trellis_core::traits::{EventSink, Summarizer};
use trellis_core::types::*;
use trellis_engine::{ExecutionRequest, GraphEngine, NodeExecutor};
use trellis_store::SqliteStore;

/// Event sink that keeps every event it sees.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GraphEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<GraphEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.of_type(event_type).len()
    }
}

impl EventSink for RecordingSink {
    fn record_event(&self, event: &GraphEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// In-memory engine with the default policy and a recording sink.
pub fn test_engine() -> (Arc<GraphEngine>, Arc<RecordingSink>) {
    let store = SqliteStore::in_memory().unwrap();
    engine_over(store)
}

/// Engine over a database file, for tests that need several connections.
pub fn file_engine(path: &Path) -> (Arc<GraphEngine>, Arc<RecordingSink>) {
    let store = SqliteStore::open(path).unwrap();
    engine_over(store)
}

/// In-memory engine whose policy is built from `config` as the binary does.
pub fn config_engine(config: &AppConfig) -> (Arc<GraphEngine>, Arc<RecordingSink>) {
    let store = SqliteStore::in_memory().unwrap();
    engine_with_policy(store, DefaultPolicy::from_config(&config.context))
}

fn engine_over(store: SqliteStore) -> (Arc<GraphEngine>, Arc<RecordingSink>) {
    engine_with_policy(store, DefaultPolicy::default())
}

fn engine_with_policy(store: SqliteStore, policy: DefaultPolicy) -> (Arc<GraphEngine>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = GraphEngine::new(
        Arc::new(store),
        Arc::new(policy),
        EventHooks::new().with_sink(sink.clone()),
    );
    (Arc::new(engine), sink)
}

/// Executor that replays queued outcomes, then finishes with `"ok"`.
#[derive(Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    seen: Mutex<Vec<(NodeId, usize)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, outcome: ExecutionOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    /// Node ids executed so far, paired with the size of their context.
    pub fn seen(&self) -> Vec<(NodeId, usize)> {
        self.seen.lock().unwrap().clone()
    }
}

impl NodeExecutor for ScriptedExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap()
                .push((request.node.id.clone(), request.context.len()));
            let next = self.outcomes.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| ExecutionOutcome::finished("ok")))
        })
    }
}

/// Summarizer that reports how many entries it was given.
pub struct CountingSummarizer;

impl Summarizer for CountingSummarizer {
    fn summarize(&self, entries: Vec<ContextEntry>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(format!("summary of {} nodes", entries.len())) })
    }
}

/// Nodes of the given types and state linked by sequence edges.
pub fn chain(engine: &GraphEngine, graph: &GraphId, types: &[&str], state: NodeState) -> Vec<NodeId> {
    engine
        .mutate(graph, |m| {
            let mut ids: Vec<NodeId> = Vec::new();
            for node_type in types {
                let node = m.create_node(NewNode::new(*node_type, state))?;
                if let Some(prev) = ids.last() {
                    m.create_edge(NewEdge::sequence(prev.clone(), node.id.clone()))?;
                }
                ids.push(node.id);
            }
            Ok(ids)
        })
        .unwrap()
}

/// A pending node of `node_type` depending on `after`.
pub fn pending_after(engine: &GraphEngine, graph: &GraphId, after: &NodeId, node_type: &str, edge: EdgeType) -> NodeId {
    engine
        .mutate(graph, |m| {
            let node = m.create_node(NewNode::new(node_type, NodeState::Pending))?;
            m.create_edge(NewEdge::new(after.clone(), node.id.clone(), edge))?;
            Ok(node.id)
        })
        .unwrap()
}

/// A finished user/agent exchange in a new turn of the main lane.
pub fn exchange(engine: &GraphEngine, graph: &GraphId, prev: Option<&NodeId>, text: &str) -> (TurnId, NodeId, NodeId) {
    let main = engine.main_lane(graph).unwrap();
    let turn = engine.create_turn(graph, &main.id).unwrap();
    engine
        .mutate(graph, |m| {
            let mut output = Map::new();
            output.insert("content".into(), json!(text));
            let user = m.create_node(
                NewNode::new(node_types::USER_MESSAGE, NodeState::Finished)
                    .in_turn(turn.id.clone())
                    .with_content(text),
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
