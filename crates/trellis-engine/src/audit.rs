//! Graph consistency scanner.
//!
//! Re-derives every structural invariant from the stored rows and reports
//! drift with a severity and the repair that would fix it. `repair` applies
//! the subset that is safe to run unattended.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use trellis_core::error::Result;
use trellis_core::traits::Policy;
use trellis_core::types::*;
use trellis_store::GraphRows;

use crate::engine::GraphEngine;
use crate::topo::{sort_nodes, TopoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    PolicyWiring,
    BodyMismatch,
    Cycle,
    DanglingEdge,
    StalePatch,
    LeafViolation,
    StaleLease,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    /// Needs a human.
    Manual,
    ArchiveEdges { edge_ids: Vec<EdgeId> },
    ApplyPatches,
    ReclaimLeases,
    RepairLeafInvariant,
}

impl RepairAction {
    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    /// Node or edge ids the issue is about.
    pub subjects: Vec<String>,
    pub repair: RepairAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub graph_id: GraphId,
    pub scanned_nodes: usize,
    pub scanned_edges: usize,
    pub issues: Vec<AuditIssue>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn worst(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    pub fn of_kind(&self, kind: IssueKind) -> Vec<&AuditIssue> {
        self.issues.iter().filter(|i| i.kind == kind).collect()
    }
}

/// What `GraphAudit::repair` changed, plus whatever it could not fix.
#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub reclaimed: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
    pub archived_edges: usize,
    pub patches_applied: Vec<NodeId>,
    pub leaves_repaired: Vec<NodeId>,
    pub remaining: AuditReport,
}

pub struct GraphAudit {
    engine: Arc<GraphEngine>,
}

impl GraphAudit {
    pub fn new(engine: Arc<GraphEngine>) -> Self {
        Self { engine }
    }

    /// Read-only scan. Takes no graph lock.
    pub fn scan(&self, graph_id: &GraphId) -> Result<AuditReport> {
        let policy = self.engine.policy();
        self.engine
            .read(graph_id, |rows| scan_rows(rows, policy, Utc::now()))
    }

    /// Fix stale leases, dangling edges, stale patches and leaf violations in
    /// one transaction, then rescan. Cycles and policy problems are left in
    /// the returned report.
    pub fn repair(&self, graph_id: &GraphId) -> Result<RepairSummary> {
        let summary = self.engine.mutate(graph_id, |m| {
            let now = m.now();
            let reclaimed = m.reclaim_expired_leases(now)?;
            let skipped = m.propagate_failures()?;

            let dangling: Vec<EdgeId> = m.rows().dangling_edges()?.into_iter().map(|e| e.id).collect();
            let archived_edges = m.rows().archive_edges(&dangling, now)?;
            if archived_edges > 0 {
                warn!(graph_id = %m.graph_id(), count = archived_edges, "Dangling edges archived");
            }

            let patches_applied = m.apply_visibility_patches()?;
            let leaves_repaired = m.repair_leaf_invariant()?.into_iter().map(|n| n.id).collect();
            let remaining = scan_rows(m.rows(), m.policy(), now)?;
            Ok(RepairSummary {
                reclaimed,
                skipped,
                archived_edges,
                patches_applied,
                leaves_repaired,
                remaining,
            })
        })?;
        info!(
            graph_id = %graph_id,
            reclaimed = summary.reclaimed.len(),
            archived_edges = summary.archived_edges,
            patches = summary.patches_applied.len(),
            leaves = summary.leaves_repaired.len(),
            remaining = summary.remaining.issues.len(),
            "Graph repaired"
        );
        Ok(summary)
    }
}

pub fn scan_rows(rows: &GraphRows<'_>, policy: &dyn Policy, now: DateTime<Utc>) -> Result<AuditReport> {
    let nodes = rows.active_nodes()?;
    let edges = rows.active_edges()?;
    let mut issues = Vec::new();

    check_policy(policy, &nodes, &mut issues);
    check_cycles(&nodes, &edges, &mut issues)?;

    let dangling = rows.dangling_edges()?;
    if !dangling.is_empty() {
        issues.push(AuditIssue {
            kind: IssueKind::DanglingEdge,
            severity: Severity::Warning,
            message: format!("{} active blocking edges touch archived nodes", dangling.len()),
            subjects: dangling.iter().map(|e| e.id.to_string()).collect(),
            repair: RepairAction::ArchiveEdges {
                edge_ids: dangling.into_iter().map(|e| e.id).collect(),
            },
        });
    }

    check_patches(rows, &nodes, &mut issues)?;
    check_leaves(rows, policy, &mut issues)?;

    let expired = rows.expired_leases(now)?;
    if !expired.is_empty() {
        issues.push(AuditIssue {
            kind: IssueKind::StaleLease,
            severity: Severity::Error,
            message: format!("{} running nodes hold expired leases", expired.len()),
            subjects: expired.iter().map(|n| n.id.to_string()).collect(),
            repair: RepairAction::ReclaimLeases,
        });
    }

    Ok(AuditReport {
        graph_id: rows.graph_id().clone(),
        scanned_nodes: nodes.len(),
        scanned_edges: edges.len(),
        issues,
    })
}

fn check_policy(policy: &dyn Policy, nodes: &[Node], issues: &mut Vec<AuditIssue>) {
    for node_type in policy.node_types() {
        if policy.body_for_node_type(&node_type).is_none() {
            issues.push(AuditIssue {
                kind: IssueKind::PolicyWiring,
                severity: Severity::Error,
                message: format!("policy lists node type {} without a body", node_type),
                subjects: Vec::new(),
                repair: RepairAction::Manual,
            });
        }
    }

    let mut unknown: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut mismatched: BTreeMap<(&str, &str), Vec<String>> = BTreeMap::new();
    for node in nodes {
        match policy.body_for_node_type(&node.node_type) {
            None => unknown
                .entry(node.node_type.as_str())
                .or_default()
                .push(node.id.to_string()),
            Some(body) if body.kind() != node.body_kind => mismatched
                .entry((node.node_type.as_str(), node.body_kind.as_str()))
                .or_default()
                .push(node.id.to_string()),
            Some(_) => {}
        }
    }
    for (node_type, ids) in unknown {
        issues.push(AuditIssue {
            kind: IssueKind::PolicyWiring,
            severity: Severity::Error,
            message: format!("{} nodes of type {} have no registered body", ids.len(), node_type),
            subjects: ids,
            repair: RepairAction::Manual,
        });
    }
    for ((node_type, stored), ids) in mismatched {
        issues.push(AuditIssue {
            kind: IssueKind::BodyMismatch,
            severity: Severity::Warning,
            message: format!("{} nodes of type {} were stored with body {}", ids.len(), node_type, stored),
            subjects: ids,
            repair: RepairAction::Manual,
        });
    }
}

fn check_cycles(nodes: &[Node], edges: &[Edge], issues: &mut Vec<AuditIssue>) -> Result<()> {
    let active: HashSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
    // Dangling edges are reported separately; leave them out of the sort.
    let blocking: Vec<Edge> = edges
        .iter()
        .filter(|e| e.is_blocking() && active.contains(&e.from_node_id) && active.contains(&e.to_node_id))
        .cloned()
        .collect();
    match sort_nodes(nodes.to_vec(), &blocking) {
        Ok(_) => Ok(()),
        Err(TopoError::Cycle { remaining }) => {
            issues.push(AuditIssue {
                kind: IssueKind::Cycle,
                severity: Severity::Critical,
                message: format!("blocking edges form a cycle through {} nodes", remaining.len()),
                subjects: remaining.into_iter().map(|id| id.0).collect(),
                repair: RepairAction::Manual,
            });
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// A patch is stale when the sweep would apply or drop it right now but
/// nothing has.
fn check_patches(rows: &GraphRows<'_>, nodes: &[Node], issues: &mut Vec<AuditIssue>) -> Result<()> {
    let patches = rows.patches()?;
    if patches.is_empty() || nodes.iter().any(|n| n.state == NodeState::Running) {
        return Ok(());
    }
    let mut stale = Vec::new();
    for patch in patches {
        let applicable = match rows.find_node(&patch.node_id)? {
            Some(node) => node.state.is_terminal(),
            None => true,
        };
        if applicable {
            stale.push(patch.node_id.to_string());
        }
    }
    if !stale.is_empty() {
        issues.push(AuditIssue {
            kind: IssueKind::StalePatch,
            severity: Severity::Warning,
            message: format!("{} visibility patches are applicable but unapplied", stale.len()),
            subjects: stale,
            repair: RepairAction::ApplyPatches,
        });
    }
    Ok(())
}

fn check_leaves(rows: &GraphRows<'_>, policy: &dyn Policy, issues: &mut Vec<AuditIssue>) -> Result<()> {
    let archived_lanes: HashSet<LaneId> = rows
        .lanes()?
        .into_iter()
        .filter(|l| l.is_archived())
        .map(|l| l.id)
        .collect();
    let invalid: Vec<String> = rows
        .leaves()?
        .into_iter()
        .filter(|n| !n.lane_id.as_ref().is_some_and(|l| archived_lanes.contains(l)))
        .filter(|n| !policy.leaf_valid(n))
        .map(|n| n.id.to_string())
        .collect();
    if !invalid.is_empty() {
        issues.push(AuditIssue {
            kind: IssueKind::LeafViolation,
            severity: Severity::Warning,
            message: format!("{} leaves violate the leaf invariant", invalid.len()),
            subjects: invalid,
            repair: RepairAction::RepairLeafInvariant,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn audit(engine: &Arc<GraphEngine>) -> GraphAudit {
        GraphAudit::new(engine.clone())
    }

    #[test]
    fn test_clean_graph() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        chain(&engine, &graph.id, &["user_message", "agent_message"]);
        let report = audit(&engine).scan(&graph.id).unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
        assert_eq!(report.scanned_nodes, 2);
        assert_eq!(report.worst(), None);
    }

    #[test]
    fn test_dangling_edge_and_leaf_repaired() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message", "agent_message"]);
        engine
            .mutate(&graph.id, |m| m.rows().archive_nodes(&ids[1..], m.now(), None))
            .unwrap();

        let report = audit(&engine).scan(&graph.id).unwrap();
        let dangling = report.of_kind(IssueKind::DanglingEdge);
        assert_eq!(dangling.len(), 1);
        assert!(matches!(dangling[0].repair, RepairAction::ArchiveEdges { ref edge_ids } if edge_ids.len() == 1));

        let summary = audit(&engine).repair(&graph.id).unwrap();
        assert_eq!(summary.archived_edges, 1);
        // With the edge gone the user message is an invalid leaf and gets healed.
        assert_eq!(summary.leaves_repaired.len(), 1);
        assert!(summary.remaining.is_clean(), "{:?}", summary.remaining.issues);
    }

    #[test]
    fn test_stale_lease_reported_and_reclaimed() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let task = engine
            .mutate(&graph.id, |m| {
                let task = m.create_node(NewNode::new("task", NodeState::Pending))?;
                let now = m.now();
                m.rows().claim(&task.id, "gone", now, now)?;
                Ok(task.id)
            })
            .unwrap();

        let report = audit(&engine).scan(&graph.id).unwrap();
        assert_eq!(report.worst(), Some(Severity::Error));
        assert_eq!(report.of_kind(IssueKind::StaleLease)[0].subjects, vec![task.to_string()]);

        let summary = audit(&engine).repair(&graph.id).unwrap();
        assert_eq!(summary.reclaimed, vec![task.clone()]);
        assert_eq!(engine.node(&graph.id, &task).unwrap().state, NodeState::Errored);
        assert!(summary.remaining.of_kind(IssueKind::StaleLease).is_empty());
    }

    #[test]
    fn test_cycle_is_critical_and_manual() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message", "agent_message"]);
        engine
            .mutate(&graph.id, |m| {
                m.rows().insert_edge(&Edge {
                    id: EdgeId::new(),
                    graph_id: m.graph_id().clone(),
                    from_node_id: ids[1].clone(),
                    to_node_id: ids[0].clone(),
                    edge_type: EdgeType::Dependency,
                    metadata: Map::new(),
                    compressed_at: None,
                    created_at: m.now(),
                })
            })
            .unwrap();

        let report = audit(&engine).scan(&graph.id).unwrap();
        let cycles = report.of_kind(IssueKind::Cycle);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].severity, Severity::Critical);
        assert!(!cycles[0].repair.is_automatic());

        let summary = audit(&engine).repair(&graph.id).unwrap();
        assert_eq!(summary.remaining.of_kind(IssueKind::Cycle).len(), 1);
    }

    #[test]
    fn test_unknown_type_and_body_mismatch() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message", "task", "agent_message"]);
        engine
            .mutate(&graph.id, |m| {
                m.rows()
                    .conn()
                    .execute("UPDATE nodes SET node_type = 'ghost' WHERE id = ?1", [ids[0].as_str()])
                    .unwrap();
                m.rows()
                    .conn()
                    .execute("UPDATE nodes SET body_kind = 'legacy_task' WHERE id = ?1", [ids[1].as_str()])
                    .unwrap();
                Ok(())
            })
            .unwrap();

        let report = audit(&engine).scan(&graph.id).unwrap();
        let wiring = report.of_kind(IssueKind::PolicyWiring);
        assert_eq!(wiring.len(), 1);
        assert_eq!(wiring[0].subjects, vec![ids[0].to_string()]);
        let mismatch = report.of_kind(IssueKind::BodyMismatch);
        assert_eq!(mismatch.len(), 1);
        assert!(mismatch[0].message.contains("legacy_task"));
    }

    #[test]
    fn test_stale_patch_applied_by_repair() {
        let engine = engine();
        let graph = engine.create_graph(Map::new()).unwrap();
        let ids = chain(&engine, &graph.id, &["user_message", "agent_message"]);
        engine
            .mutate(&graph.id, |m| m.rows().upsert_patch(&ids[0], Some(true), None, m.now()))
            .unwrap();

        let report = audit(&engine).scan(&graph.id).unwrap();
        assert_eq!(report.of_kind(IssueKind::StalePatch).len(), 1);

        let summary = audit(&engine).repair(&graph.id).unwrap();
        assert_eq!(summary.patches_applied, vec![ids[0].clone()]);
        assert!(engine.node(&graph.id, &ids[0]).unwrap().context_excluded_at.is_some());
    }
}
