use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TrellisError};

/// JSON object used for node payloads and metadata.
pub type Map = serde_json::Map<String, serde_json::Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Time-ordered id, so sorting by id approximates creation order.
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn from_string(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Root aggregate identifier.
    GraphId
);
string_id!(NodeId);
string_id!(EdgeId);
string_id!(LaneId);
string_id!(TurnId);

/// Well-known node types. Hosts may register more through the policy.
pub mod node_types {
    pub const USER_MESSAGE: &str = "user_message";
    pub const AGENT_MESSAGE: &str = "agent_message";
    pub const TASK: &str = "task";
    pub const SUMMARY: &str = "summary";
    pub const SYSTEM_MESSAGE: &str = "system_message";
    pub const DEVELOPER_MESSAGE: &str = "developer_message";
}

/// Execution state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Finished,
    Errored,
    Rejected,
    Skipped,
    Cancelled,
}

impl NodeState {
    pub const TERMINAL: [NodeState; 5] = [
        NodeState::Finished,
        NodeState::Errored,
        NodeState::Rejected,
        NodeState::Skipped,
        NodeState::Cancelled,
    ];

    /// Terminal states that block dependents.
    pub const FAILING: [NodeState; 4] = [
        NodeState::Errored,
        NodeState::Rejected,
        NodeState::Skipped,
        NodeState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_failure(&self) -> bool {
        Self::FAILING.contains(self)
    }
}

impl FromStr for NodeState {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "errored" => Ok(Self::Errored),
            "rejected" => Ok(Self::Rejected),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TrellisError::Validation(format!(
                "unknown node state: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relation kind between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Sequence,
    Dependency,
    Branch,
}

impl EdgeType {
    pub const BLOCKING: [EdgeType; 2] = [EdgeType::Sequence, EdgeType::Dependency];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Dependency => "dependency",
            Self::Branch => "branch",
        }
    }

    /// Sequence and dependency edges order context and propagate failure;
    /// branch edges only record provenance.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Branch)
    }
}

impl FromStr for EdgeType {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequence" => Ok(Self::Sequence),
            "dependency" => Ok(Self::Dependency),
            "branch" => Ok(Self::Branch),
            other => Err(TrellisError::Validation(format!(
                "unknown edge type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    /// Key for the per-graph advisory lock, derived from the id.
    pub lock_key: i64,
    pub metadata: Map,
    pub created_at: DateTime<Utc>,
}

/// A unit of work or message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub graph_id: GraphId,
    pub node_type: String,
    pub state: NodeState,
    /// Body class resolved from the node type when the node was created.
    pub body_kind: String,
    pub input: Map,
    pub output: Map,
    pub output_preview: Map,
    pub metadata: Map,
    pub lane_id: Option<LaneId>,
    pub turn_id: Option<TurnId>,
    pub idempotency_key: Option<String>,
    pub retry_of_id: Option<NodeId>,
    pub error: Option<String>,
    pub compressed_at: Option<DateTime<Utc>>,
    pub compressed_by_id: Option<NodeId>,
    pub context_excluded_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Not archived by compression or replacement.
    pub fn is_active(&self) -> bool {
        self.compressed_at.is_none()
    }

    /// Neither soft-deleted nor excluded from context.
    pub fn is_visible(&self) -> bool {
        self.deleted_at.is_none() && self.context_excluded_at.is_none()
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map_or(true, |at| at <= now)
    }

    /// Text content of the output, if the body wrote one.
    pub fn content(&self) -> Option<&str> {
        self.output.get("content").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub graph_id: GraphId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub edge_type: EdgeType,
    pub metadata: Map,
    pub compressed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn is_active(&self) -> bool {
        self.compressed_at.is_none()
    }

    pub fn is_blocking(&self) -> bool {
        self.edge_type.is_blocking()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneRole {
    Main,
    Branch,
}

impl LaneRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Branch => "branch",
        }
    }
}

impl FromStr for LaneRole {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(Self::Main),
            "branch" => Ok(Self::Branch),
            other => Err(TrellisError::Validation(format!(
                "unknown lane role: {}",
                other
            ))),
        }
    }
}

/// Branch container partitioning nodes and turns into independent threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    pub id: LaneId,
    pub graph_id: GraphId,
    pub role: LaneRole,
    pub name: Option<String>,
    pub parent_lane_id: Option<LaneId>,
    pub forked_from_node_id: Option<NodeId>,
    pub root_node_id: Option<NodeId>,
    pub merged_into_lane_id: Option<LaneId>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Lane {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Nodes created in one logical exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub graph_id: GraphId,
    pub lane_id: LaneId,
    /// Position within the lane, starting at 1.
    pub seq: i64,
    /// First node created in the turn.
    pub anchor_node_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
}

/// Deferred visibility change, at most one per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityPatch {
    pub node_id: NodeId,
    pub graph_id: GraphId,
    pub context_excluded: Option<bool>,
    pub deleted: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    OutputDelta,
    Progress,
    Log,
}

impl NodeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutputDelta => "output_delta",
            Self::Progress => "progress",
            Self::Log => "log",
        }
    }
}

impl FromStr for NodeEventKind {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "output_delta" => Ok(Self::OutputDelta),
            "progress" => Ok(Self::Progress),
            "log" => Ok(Self::Log),
            other => Err(TrellisError::Validation(format!(
                "unknown node event kind: {}",
                other
            ))),
        }
    }
}

/// Append-only progress stream entry for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: i64,
    pub graph_id: GraphId,
    pub node_id: NodeId,
    pub kind: NodeEventKind,
    pub text: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Request to create a node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub node_type: String,
    pub state: NodeState,
    pub idempotency_key: Option<String>,
    pub lane_id: Option<LaneId>,
    pub turn_id: Option<TurnId>,
    pub input: Map,
    pub output: Map,
    pub metadata: Map,
    pub retry_of_id: Option<NodeId>,
}

impl NewNode {
    pub fn new(node_type: impl Into<String>, state: NodeState) -> Self {
        Self {
            node_type: node_type.into(),
            state,
            idempotency_key: None,
            lane_id: None,
            turn_id: None,
            input: Map::new(),
            output: Map::new(),
            metadata: Map::new(),
            retry_of_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn in_lane(mut self, lane: LaneId) -> Self {
        self.lane_id = Some(lane);
        self
    }

    pub fn in_turn(mut self, turn: TurnId) -> Self {
        self.turn_id = Some(turn);
        self
    }

    pub fn with_input(mut self, input: Map) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Map) -> Self {
        self.output = output;
        self
    }

    pub fn with_metadata(mut self, metadata: Map) -> Self {
        self.metadata = metadata;
        self
    }

    /// Shorthand for a `{"content": text}` input.
    pub fn with_content(mut self, text: impl Into<String>) -> Self {
        self.input
            .insert("content".into(), serde_json::Value::String(text.into()));
        self
    }
}

/// Request to create an edge.
#[derive(Debug, Clone)]
pub struct NewEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub edge_type: EdgeType,
    pub metadata: Map,
}

impl NewEdge {
    pub fn new(from: NodeId, to: NodeId, edge_type: EdgeType) -> Self {
        Self {
            from,
            to,
            edge_type,
            metadata: Map::new(),
        }
    }

    pub fn sequence(from: NodeId, to: NodeId) -> Self {
        Self::new(from, to, EdgeType::Sequence)
    }

    pub fn dependency(from: NodeId, to: NodeId) -> Self {
        Self::new(from, to, EdgeType::Dependency)
    }

    pub fn with_metadata(mut self, metadata: Map) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Payload mode for context projections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    #[default]
    Preview,
    Full,
}

/// A node projected into an assembled context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub node_id: NodeId,
    pub node_type: String,
    pub state: NodeState,
    pub turn_id: Option<TurnId>,
    pub lane_id: Option<LaneId>,
    pub input: Map,
    /// Full output in `Full` mode, the output preview in `Preview` mode.
    pub output: Map,
    pub metadata: Map,
}

impl ContextEntry {
    pub fn project(node: &Node, mode: ContextMode) -> Self {
        let output = match mode {
            ContextMode::Full => node.output.clone(),
            ContextMode::Preview => node.output_preview.clone(),
        };
        Self {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            state: node.state,
            turn_id: node.turn_id.clone(),
            lane_id: node.lane_id.clone(),
            input: node.input.clone(),
            output,
            metadata: node.metadata.clone(),
        }
    }
}

/// Token usage reported by an executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result returned by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Finished {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        payload: Map,
        #[serde(default)]
        metadata: Map,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Errored {
        reason: String,
    },
    Rejected {
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

impl ExecutionOutcome {
    pub fn finished(content: impl Into<String>) -> Self {
        Self::Finished {
            content: Some(content.into()),
            payload: Map::new(),
            metadata: Map::new(),
            usage: None,
        }
    }

    pub fn errored(reason: impl Into<String>) -> Self {
        Self::Errored {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Parse a result reported as JSON. Unknown or malformed states become
    /// `Errored` instead of being dropped.
    pub fn from_value(value: serde_json::Value) -> Self {
        let state = value
            .get("state")
            .and_then(|s| s.as_str())
            .map(str::to_string);
        match serde_json::from_value::<ExecutionOutcome>(value) {
            Ok(outcome) => outcome,
            Err(e) => match state {
                Some(s) if !matches!(s.as_str(), "finished" | "errored" | "rejected" | "skipped") => {
                    Self::errored(format!("unknown result state: {}", s))
                }
                Some(s) => Self::errored(format!("malformed {} result: {}", s, e)),
                None => Self::errored("result is missing a state"),
            },
        }
    }

    /// Node state this outcome transitions to.
    pub fn target_state(&self) -> NodeState {
        match self {
            Self::Finished { .. } => NodeState::Finished,
            Self::Errored { .. } => NodeState::Errored,
            Self::Rejected { .. } => NodeState::Rejected,
            Self::Skipped { .. } => NodeState::Skipped,
        }
    }
}

/// Audit event kinds emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeCreated,
    EdgeCreated,
    NodeReplaced,
    SubgraphCompressed,
    LeafInvariantRepaired,
    NodeStateChanged,
    NodeVisibilityChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeCreated => "node_created",
            Self::EdgeCreated => "edge_created",
            Self::NodeReplaced => "node_replaced",
            Self::SubgraphCompressed => "subgraph_compressed",
            Self::LeafInvariantRepaired => "leaf_invariant_repaired",
            Self::NodeStateChanged => "node_state_changed",
            Self::NodeVisibilityChanged => "node_visibility_changed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Graph,
    Node,
    Edge,
    Lane,
}

/// An audit event describing one committed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    pub graph_id: GraphId,
    pub event_type: EventType,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub particulars: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl GraphEvent {
    pub fn new(
        graph_id: &GraphId,
        event_type: EventType,
        subject_type: SubjectType,
        subject_id: impl std::fmt::Display,
        particulars: serde_json::Value,
    ) -> Self {
        Self {
            graph_id: graph_id.clone(),
            event_type,
            subject_type,
            subject_id: subject_id.to_string(),
            particulars,
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_state_terminal_and_failure() {
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Running.is_terminal());
        assert!(NodeState::Finished.is_terminal());
        assert!(!NodeState::Finished.is_failure());
        for s in NodeState::FAILING {
            assert!(s.is_terminal());
            assert!(s.is_failure());
        }
    }

    #[test]
    fn test_node_state_parse() {
        assert_eq!("skipped".parse::<NodeState>().unwrap(), NodeState::Skipped);
        assert!("paused".parse::<NodeState>().is_err());
    }

    #[test]
    fn test_edge_blocking() {
        assert!(EdgeType::Sequence.is_blocking());
        assert!(EdgeType::Dependency.is_blocking());
        assert!(!EdgeType::Branch.is_blocking());
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(a < b);
    }

    #[test]
    fn test_outcome_from_value_known_states() {
        let outcome = ExecutionOutcome::from_value(json!({"state": "finished", "content": "x"}));
        assert_eq!(outcome, ExecutionOutcome::finished("x"));

        let outcome = ExecutionOutcome::from_value(json!({"state": "rejected", "reason": "no"}));
        assert_eq!(outcome, ExecutionOutcome::rejected("no"));
    }

    #[test]
    fn test_outcome_from_value_unknown_state_is_error() {
        let outcome = ExecutionOutcome::from_value(json!({"state": "paused"}));
        match outcome {
            ExecutionOutcome::Errored { reason } => assert!(reason.contains("paused")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let outcome = ExecutionOutcome::from_value(json!({"content": "x"}));
        assert_eq!(outcome.target_state(), NodeState::Errored);
    }

    #[test]
    fn test_context_entry_projection_modes() {
        let mut output = Map::new();
        output.insert("content".into(), json!("full text"));
        let mut preview = Map::new();
        preview.insert("content".into(), json!("full…"));
        let node = Node {
            id: NodeId::new(),
            graph_id: GraphId::new(),
            node_type: node_types::AGENT_MESSAGE.into(),
            state: NodeState::Finished,
            body_kind: "agent_message".into(),
            input: Map::new(),
            output,
            output_preview: preview,
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
        };

        let full = ContextEntry::project(&node, ContextMode::Full);
        assert_eq!(full.output["content"], json!("full text"));
        let preview = ContextEntry::project(&node, ContextMode::Preview);
        assert_eq!(preview.output["content"], json!("full…"));
    }
}
