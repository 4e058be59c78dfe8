//! Executes one claimed node: lease refresh, context, executor, result.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use trellis_core::body::{preview_map, DEFAULT_PREVIEW_CHARS};
use trellis_core::config::SchedulerConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;
use trellis_store::Transition;

use crate::budget::ContextBudgetManager;
use crate::context::{AncestorClosure, ContextAssembler, ContextRequest};
use crate::engine::GraphEngine;
use crate::mutation::Mutator;
use crate::registry::{ExecutionRequest, ExecutorRegistry};
use crate::scheduler::{lease_duration, TickQueue};

/// What a run did to its node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub node_id: NodeId,
    /// State after the run.
    pub state: NodeState,
    /// False when the lease was gone before or after execution and the node
    /// was left to whoever holds it now.
    pub transitioned: bool,
    pub skipped: Vec<NodeId>,
    pub repaired: Vec<NodeId>,
}

/// Runs claimed nodes against the executors registered for their types.
///
/// The graph lock is held only to refresh the lease before execution and to
/// apply the result after it; executors run unlocked. Failure propagation and
/// leaf repair run in a second transaction after the result is stored.
pub struct Runner {
    engine: Arc<GraphEngine>,
    registry: ExecutorRegistry,
    assembler: Arc<dyn ContextAssembler>,
    budget: Option<ContextBudgetManager>,
    mode: ContextMode,
    lease: chrono::Duration,
    ticks: Option<TickQueue>,
    kick_limit: usize,
}

impl Runner {
    pub fn new(engine: Arc<GraphEngine>, registry: ExecutorRegistry, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            registry,
            assembler: Arc::new(AncestorClosure),
            budget: None,
            mode: ContextMode::default(),
            lease: lease_duration(config.lease_seconds),
            ticks: None,
            kick_limit: config.claim_limit,
        }
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn ContextAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    /// Fit every context to a token budget instead of using the assembler.
    pub fn with_budget(mut self, budget: ContextBudgetManager) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_mode(mut self, mode: ContextMode) -> Self {
        self.mode = mode;
        self
    }

    /// Kick this queue after every run so dependents get scheduled.
    pub fn with_ticks(mut self, ticks: TickQueue) -> Self {
        self.ticks = Some(ticks);
        self
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Run a node leased to `worker`.
    ///
    /// Executor failures and panics are recorded on the node, never returned.
    /// `Err` only reports store failures while storing the result. A failed
    /// propagation or leaf repair is logged and left for the audit sweep. The
    /// graph is kicked either way.
    pub async fn run(&self, graph_id: &GraphId, node_id: &NodeId, worker: &str) -> Result<RunReport> {
        let result = self.run_inner(graph_id, node_id, worker).await;
        if let Some(ticks) = &self.ticks {
            ticks.kick(graph_id, self.kick_limit);
        }
        result
    }

    async fn run_inner(&self, graph_id: &GraphId, node_id: &NodeId, worker: &str) -> Result<RunReport> {
        let Some(node) = self.refresh_lease(graph_id, node_id, worker)? else {
            let node = self.engine.node(graph_id, node_id)?;
            warn!(node_id = %node_id, worker, state = %node.state, "Lease not held, run abandoned");
            return Ok(RunReport {
                node_id: node_id.clone(),
                state: node.state,
                transitioned: false,
                skipped: Vec::new(),
                repaired: Vec::new(),
            });
        };

        info!(graph_id = %graph_id, node_id = %node.id, node_type = %node.node_type, worker, "Running node");
        let outcome = self.execute(graph_id, &node, worker).await;
        if let ExecutionOutcome::Errored { reason } = &outcome {
            error!(node_id = %node.id, node_type = %node.node_type, reason = %reason, "Node errored");
        }

        // The outcome commits on its own so a failing follow-up cannot undo it.
        let transitioned = self
            .engine
            .mutate(graph_id, |m| m.apply_outcome(&node.id, outcome))?;
        let (skipped, repaired) = match self.engine.mutate(graph_id, |m| {
            let skipped = m.propagate_failures()?;
            let repaired = m.repair_leaf_invariant()?.into_iter().map(|n| n.id).collect();
            Ok((skipped, repaired))
        }) {
            Ok(settled) => settled,
            Err(e) => {
                warn!(graph_id = %graph_id, node_id = %node.id, error = %e, "Post-run settling failed, left for audit");
                (Vec::new(), Vec::new())
            }
        };

        let report = RunReport {
            node_id: node.id.clone(),
            state: self.engine.node(graph_id, &node.id)?.state,
            transitioned,
            skipped,
            repaired,
        };
        info!(node_id = %node.id, state = %report.state, skipped = report.skipped.len(), "Run applied");
        Ok(report)
    }

    /// Check the node is running under `worker`'s live lease and extend it.
    fn refresh_lease(&self, graph_id: &GraphId, node_id: &NodeId, worker: &str) -> Result<Option<Node>> {
        self.engine.mutate(graph_id, |m| {
            let node = m.member_node(node_id)?;
            if node.state != NodeState::Running {
                return Ok(None);
            }
            let now = m.now();
            if !m.rows().heartbeat(&node.id, worker, now, now + self.lease)? {
                return Ok(None);
            }
            m.rows().node(&node.id).map(Some)
        })
    }

    /// Context, executor lookup and execution folded into one outcome.
    async fn execute(&self, graph_id: &GraphId, node: &Node, worker: &str) -> ExecutionOutcome {
        let context = match self.context(graph_id, node).await {
            Ok(entries) => entries,
            Err(e) => return ExecutionOutcome::errored(format!("context assembly failed: {}", e)),
        };
        let Some(executor) = self.registry.get(&node.node_type) else {
            return ExecutionOutcome::errored(TrellisError::ExecutorNotFound(node.node_type.clone()).to_string());
        };
        let request = ExecutionRequest {
            engine: self.engine.clone(),
            graph_id: graph_id.clone(),
            node: node.clone(),
            context,
            worker_id: worker.to_string(),
        };
        match AssertUnwindSafe(executor.execute(request)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ExecutionOutcome::errored(e.to_string()),
            Err(panic) => ExecutionOutcome::errored(format!("executor panicked: {}", panic_message(&*panic))),
        }
    }

    async fn context(&self, graph_id: &GraphId, node: &Node) -> Result<Vec<ContextEntry>> {
        if let Some(budget) = &self.budget {
            let fitted = budget.fit(&self.engine, graph_id, &node.id, Vec::new()).await?;
            return Ok(fitted.entries);
        }
        let request = ContextRequest::new(node.id.clone()).with_mode(self.mode);
        let assembled = self.engine.assemble(graph_id, self.assembler.as_ref(), &request)?;
        Ok(assembled.entries)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<'a> Mutator<'a> {
    /// Settle a running node with an executor's outcome. Returns `false`,
    /// changing nothing, if the node is no longer running.
    pub fn apply_outcome(&mut self, node_id: &NodeId, outcome: ExecutionOutcome) -> Result<bool> {
        let node = self.member_node(node_id)?;
        let to = outcome.target_state();
        let now = self.now();

        let transitioned = match &outcome {
            ExecutionOutcome::Finished {
                content,
                payload,
                metadata,
                usage,
            } => {
                let mut output = node.output.clone();
                for (k, v) in payload {
                    output.insert(k.clone(), v.clone());
                }
                if let Some(content) = content {
                    output.insert("content".into(), Value::String(content.clone()));
                }
                let preview = match self.policy().body_for_node_type(&node.node_type) {
                    Some(body) => body.output_preview(&output),
                    None => preview_map(&output, DEFAULT_PREVIEW_CHARS),
                };
                let mut merged = node.metadata.clone();
                for (k, v) in metadata {
                    merged.insert(k.clone(), v.clone());
                }
                if let Some(usage) = usage {
                    merged.insert("usage".into(), json!(usage));
                }
                let change = Transition::at(now)
                    .with_output(&output, &preview)
                    .with_metadata(&merged);
                self.rows()
                    .transition(&node.id, &[NodeState::Running], to, &change)?
            }
            ExecutionOutcome::Errored { reason }
            | ExecutionOutcome::Rejected { reason }
            | ExecutionOutcome::Skipped { reason } => {
                let change = Transition::at(now).with_error(reason);
                self.rows()
                    .transition(&node.id, &[NodeState::Running], to, &change)?
            }
        };

        if !transitioned {
            warn!(node_id = %node.id, state = %node.state, to = %to, "Result dropped, node no longer running");
            return Ok(false);
        }
        let mut particulars = json!({ "from": NodeState::Running, "to": to });
        if let ExecutionOutcome::Errored { reason }
        | ExecutionOutcome::Rejected { reason }
        | ExecutionOutcome::Skipped { reason } = &outcome
        {
            particulars["reason"] = json!(reason);
        }
        self.emit(EventType::NodeStateChanged, SubjectType::Node, &node.id, particulars);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeExecutor;
    use crate::scheduler::Scheduler;
    use crate::testing::*;
    use futures::future::BoxFuture;
    use trellis_core::body::NodeBody;
    use trellis_core::hooks::EventHooks;
    use trellis_core::policy::DefaultPolicy;
    use trellis_core::traits::Policy;
    use trellis_store::SqliteStore;

    struct Reply(ExecutionOutcome);

    impl NodeExecutor for Reply {
        fn execute(&self, _request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            let outcome = self.0.clone();
            Box::pin(async move { Ok(outcome) })
        }
    }

    struct Panics;

    impl NodeExecutor for Panics {
        fn execute(&self, _request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async move { panic!("model client exploded") })
        }
    }

    struct Fails;

    impl NodeExecutor for Fails {
        fn execute(&self, _request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async move { Err(TrellisError::Executor("rate limited".into())) })
        }
    }

    /// Appends a follow-up task while running and reports what it saw.
    struct Expands;

    impl NodeExecutor for Expands {
        fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async move {
                let seen = request.context.len();
                request.emit_delta("thinking")?;
                let parent = request.node.id.clone();
                request.mutate(|m| {
                    let task = m.create_node(NewNode::new("task", NodeState::Finished))?;
                    m.create_edge(NewEdge::dependency(parent, task.id))?;
                    Ok(())
                })?;
                Ok(ExecutionOutcome::finished(format!("saw {}", seen)))
            })
        }
    }

    fn setup(executor: impl NodeExecutor) -> (Arc<GraphEngine>, Arc<RecordingSink>, GraphId, NodeId, Runner) {
        let (engine, sink) = engine_with_sink();
        let graph = engine.create_graph(Map::new()).unwrap();
        let b = engine
            .mutate(&graph.id, |m| {
                let a = m.create_node(NewNode::new("user_message", NodeState::Finished).with_content("hi"))?;
                let b = m.create_node(NewNode::new("agent_message", NodeState::Pending))?;
                m.create_edge(NewEdge::sequence(a.id, b.id.clone()))?;
                Ok(b.id)
            })
            .unwrap();
        let mut registry = ExecutorRegistry::new();
        registry.register("agent_message", executor);
        let runner = Runner::new(engine.clone(), registry, &SchedulerConfig::default());
        (engine, sink, graph.id, b, runner)
    }

    fn claim(engine: &Arc<GraphEngine>, graph: &GraphId) -> Vec<Node> {
        Scheduler::new(engine.clone(), &SchedulerConfig::default())
            .with_worker_id("w1")
            .claim(graph, 10)
            .unwrap()
    }

    #[tokio::test]
    async fn test_finished_result_applied_once() {
        let (engine, sink, graph, b, runner) = setup(Reply(ExecutionOutcome::finished("x")));
        claim(&engine, &graph);
        let report = runner.run(&graph, &b, "w1").await.unwrap();
        assert!(report.transitioned);
        assert_eq!(report.state, NodeState::Finished);

        let node = engine.node(&graph, &b).unwrap();
        assert_eq!(node.content(), Some("x"));
        assert!(node.finished_at.is_some());
        assert!(node.lease_expires_at.is_none());
        let changes: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::NodeStateChanged)
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].particulars["to"], "finished");
    }

    #[tokio::test]
    async fn test_panic_becomes_errored() {
        let (engine, _, graph, b, runner) = setup(Panics);
        claim(&engine, &graph);
        let report = runner.run(&graph, &b, "w1").await.unwrap();
        assert_eq!(report.state, NodeState::Errored);
        let node = engine.node(&graph, &b).unwrap();
        assert!(node.error.unwrap().contains("model client exploded"));
    }

    #[tokio::test]
    async fn test_executor_error_and_missing_executor() {
        let (engine, _, graph, b, runner) = setup(Fails);
        claim(&engine, &graph);
        runner.run(&graph, &b, "w1").await.unwrap();
        assert_eq!(engine.node(&graph, &b).unwrap().error.as_deref(), Some("Executor error: rate limited"));

        let (engine, _, graph, b, _) = setup(Fails);
        let runner = Runner::new(engine.clone(), ExecutorRegistry::new(), &SchedulerConfig::default());
        claim(&engine, &graph);
        let report = runner.run(&graph, &b, "w1").await.unwrap();
        assert_eq!(report.state, NodeState::Errored);
        assert!(engine.node(&graph, &b).unwrap().error.unwrap().contains("agent_message"));
    }

    #[tokio::test]
    async fn test_rejected_result_skips_dependents() {
        let (engine, _, graph, b, runner) = setup(Reply(ExecutionOutcome::rejected("policy")));
        let dependent = engine
            .mutate(&graph, |m| {
                let t = m.create_node(NewNode::new("task", NodeState::Pending))?;
                m.create_edge(NewEdge::dependency(b.clone(), t.id.clone()))?;
                Ok(t.id)
            })
            .unwrap();
        claim(&engine, &graph);
        let report = runner.run(&graph, &b, "w1").await.unwrap();
        assert_eq!(report.state, NodeState::Rejected);
        assert_eq!(report.skipped, vec![dependent.clone()]);
        assert_eq!(engine.node(&graph, &dependent).unwrap().state, NodeState::Skipped);
    }

    #[tokio::test]
    async fn test_unclaimed_node_not_run() {
        let (engine, sink, graph, b, runner) = setup(Reply(ExecutionOutcome::finished("x")));
        let report = runner.run(&graph, &b, "w1").await.unwrap();
        assert!(!report.transitioned);
        assert_eq!(report.state, NodeState::Pending);

        // Someone else's lease is not ours to use.
        claim(&engine, &graph);
        let report = runner.run(&graph, &b, "w2").await.unwrap();
        assert!(!report.transitioned);
        assert_eq!(report.state, NodeState::Running);
        assert_eq!(sink.count(EventType::NodeStateChanged), 0);
    }

    #[tokio::test]
    async fn test_executor_mutates_and_streams() {
        let (engine, _, graph, b, runner) = setup(Expands);
        claim(&engine, &graph);
        runner.run(&graph, &b, "w1").await.unwrap();
        let node = engine.node(&graph, &b).unwrap();
        assert_eq!(node.content(), Some("saw 2"));
        let out = engine.read(&graph, |rows| rows.active_outgoing(&b)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(engine.node_events(&graph, &b).unwrap()[0].text, "thinking");
    }

    /// Default rules, except leaf repair asks for a type nothing can build.
    struct UnbuildableRepair(DefaultPolicy);

    impl Policy for UnbuildableRepair {
        fn body_for_node_type(&self, node_type: &str) -> Option<Arc<dyn NodeBody>> {
            self.0.body_for_node_type(node_type)
        }

        fn node_types(&self) -> Vec<String> {
            self.0.node_types()
        }

        fn leaf_valid(&self, node: &Node) -> bool {
            self.0.leaf_valid(node)
        }

        fn leaf_repair_node_attributes(&self, _leaf: &Node) -> Option<NewNode> {
            Some(NewNode::new("unregistered_type", NodeState::Pending))
        }
    }

    #[tokio::test]
    async fn test_failed_leaf_repair_keeps_stored_result() {
        let engine = Arc::new(GraphEngine::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(UnbuildableRepair(DefaultPolicy::default())),
            EventHooks::new(),
        ));
        let graph = engine.create_graph(Map::new()).unwrap().id;
        let task = engine
            .mutate(&graph, |m| {
                let a = m.create_node(NewNode::new("user_message", NodeState::Finished).with_content("hi"))?;
                let task = m.create_node(NewNode::new("task", NodeState::Pending))?;
                m.create_edge(NewEdge::dependency(a.id, task.id.clone()))?;
                Ok(task.id)
            })
            .unwrap();
        let mut registry = ExecutorRegistry::new();
        registry.register("task", Reply(ExecutionOutcome::finished("answer")));
        let runner = Runner::new(engine.clone(), registry, &SchedulerConfig::default());
        claim(&engine, &graph);

        // The finished task is an invalid leaf whose repair cannot be created.
        let report = runner.run(&graph, &task, "w1").await.unwrap();
        assert!(report.transitioned);
        assert_eq!(report.state, NodeState::Finished);
        assert!(report.repaired.is_empty());

        let node = engine.node(&graph, &task).unwrap();
        assert_eq!(node.state, NodeState::Finished);
        assert_eq!(node.content(), Some("answer"));
        assert!(node.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_run_kicks_graph() {
        let (engine, _, graph, b, runner) = setup(Reply(ExecutionOutcome::finished("x")));
        let (queue, mut rx) = TickQueue::new();
        let runner = runner.with_ticks(queue);
        claim(&engine, &graph);
        runner.run(&graph, &b, "w1").await.unwrap();
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.graph_id, graph);
    }
}
