pub mod audit;
pub mod budget;
pub mod compression;
pub mod context;
pub mod engine;
pub mod event_log;
pub mod invariant;
pub mod mutation;
pub mod propagation;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod tokens;
pub mod topo;
pub mod visibility;

#[cfg(test)]
mod testing;

pub use audit::{AuditIssue, AuditReport, GraphAudit, IssueKind, RepairAction, RepairSummary, Severity};
pub use budget::{BudgetDecision, ContextBudgetManager, FittedContext};
pub use context::{
    AncestorClosure, AssembledContext, ContextAssembler, ContextRequest, ContextScope, FullClosure,
    WindowedAssembler,
};
pub use engine::GraphEngine;
pub use event_log::EventLogger;
pub use mutation::{deep_merge, Fork, Mutator};
pub use registry::{ExecutionRequest, ExecutorRegistry, NodeExecutor};
pub use runner::{RunReport, Runner};
pub use scheduler::{Scheduler, Tick, TickQueue, TickReceiver, Worker, LEASE_EXPIRED_REASON};
pub use topo::{sort_nodes, topo_sort, TopoError};
pub use visibility::VisibilityOutcome;
