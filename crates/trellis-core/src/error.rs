use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Estimated token usage of an assembled context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub context: usize,
    pub memory: usize,
    pub total: usize,
    pub limit: usize,
}

#[derive(Debug, Error)]
pub enum TrellisError {
    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Node {node} is {actual}, expected one of [{expected}]")]
    InvalidState {
        node: String,
        actual: String,
        expected: String,
    },

    #[error("Cross-graph reference: {0}")]
    CrossGraph(String),

    // Consistency errors
    #[error("Edge {from} -> {to} would create a cycle")]
    CycleDetected { from: String, to: String },

    #[error("Idempotency key collision with divergent payload: {key}")]
    IdempotencyConflict { key: String },

    #[error("Edge {0} exists but is archived")]
    ArchivedEdge(String),

    #[error("Cycle among nodes: {0:?}")]
    GraphCycle(Vec<String>),

    // Concurrency errors
    #[error("Graph lock busy: {0}")]
    LockBusy(String),

    // Budget errors
    #[error("Context window exceeded: {} estimated tokens > {} limit", .estimated.total, .estimated.limit)]
    ContextWindowExceeded { estimated: TokenBreakdown },

    // Execution errors
    #[error("Executor error: {0}")]
    Executor(String),

    #[error("No executor registered for node type: {0}")]
    ExecutorNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Validation and consistency errors are caller mistakes; everything else
    /// is infrastructure.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound { .. }
                | Self::InvalidState { .. }
                | Self::CrossGraph(_)
                | Self::CycleDetected { .. }
                | Self::IdempotencyConflict { .. }
                | Self::ArchivedEdge(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
