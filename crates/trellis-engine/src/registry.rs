use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use trellis_core::error::Result;
use trellis_core::types::*;

use crate::engine::GraphEngine;
use crate::mutation::Mutator;

/// Everything an executor gets for one run.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub engine: Arc<GraphEngine>,
    pub graph_id: GraphId,
    pub node: Node,
    pub context: Vec<ContextEntry>,
    pub worker_id: String,
}

impl ExecutionRequest {
    /// Structural changes on behalf of the running node, e.g. appending the
    /// tool calls it decided to make.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut Mutator<'_>) -> Result<T>) -> Result<T> {
        self.engine.mutate(&self.graph_id, f)
    }

    /// Stream a chunk of output to the node's event log.
    pub fn emit_delta(&self, text: &str) -> Result<i64> {
        self.engine
            .append_node_event(&self.graph_id, &self.node.id, NodeEventKind::OutputDelta, text, Value::Null)
    }

    pub fn emit_progress(&self, text: &str, payload: Value) -> Result<i64> {
        self.engine
            .append_node_event(&self.graph_id, &self.node.id, NodeEventKind::Progress, text, payload)
    }
}

/// Runs nodes of one or more types.
///
/// Returning `Err` (or panicking) marks the node errored; a reported
/// `ExecutionOutcome` moves it to the matching terminal state.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>>;
}

/// Node type -> executor, handed to the runner at construction.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: impl Into<String>, executor: impl NodeExecutor) {
        self.executors.insert(node_type.into(), Arc::new(executor));
    }

    /// Register one shared executor for several node types.
    pub fn register_shared(&mut self, node_types: &[&str], executor: Arc<dyn NodeExecutor>) {
        for node_type in node_types {
            self.executors.insert((*node_type).to_string(), executor.clone());
        }
    }

    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.executors.remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl NodeExecutor for Echo {
        fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async move { Ok(ExecutionOutcome::finished(request.node.node_type)) })
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register("task", Echo);
        registry.register_shared(&["agent_message", "summary"], Arc::new(Echo));
        assert_eq!(registry.node_types(), vec!["agent_message", "summary", "task"]);
        assert!(registry.get("task").is_some());
        assert!(registry.get("user_message").is_none());
        assert!(registry.unregister("summary"));
        assert!(!registry.unregister("summary"));
    }
}
