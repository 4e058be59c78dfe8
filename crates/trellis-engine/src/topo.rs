//! Deterministic topological sort and cycle detection.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use trellis_core::error::TrellisError;
use trellis_core::types::{Edge, Node, NodeId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopoError {
    /// Nodes that never reached in-degree zero.
    #[error("Cycle among {} nodes", .remaining.len())]
    Cycle { remaining: Vec<NodeId> },

    #[error("Edge references node outside the sorted set: {0}")]
    UnknownNode(NodeId),
}

impl From<TopoError> for TrellisError {
    fn from(e: TopoError) -> Self {
        match e {
            TopoError::Cycle { remaining } => {
                TrellisError::GraphCycle(remaining.into_iter().map(|id| id.0).collect())
            }
            TopoError::UnknownNode(id) => TrellisError::not_found("node", id),
        }
    }
}

/// Kahn's algorithm over `nodes` and `(from, to)` pairs. Ready nodes are
/// released in ascending id order, so the result is identical across runs.
pub fn topo_sort(nodes: &[NodeId], edges: &[(NodeId, NodeId)]) -> Result<Vec<NodeId>, TopoError> {
    let mut in_degree: HashMap<&NodeId, usize> = nodes.iter().map(|id| (id, 0)).collect();
    let mut successors: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();

    for (from, to) in edges {
        if !in_degree.contains_key(from) {
            return Err(TopoError::UnknownNode(from.clone()));
        }
        match in_degree.get_mut(to) {
            Some(d) => *d += 1,
            None => return Err(TopoError::UnknownNode(to.clone())),
        }
        successors.entry(from).or_default().push(to);
    }

    let mut ready: BTreeSet<&NodeId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.clone());
        if let Some(next) = successors.get(id) {
            for to in next {
                if let Some(d) = in_degree.get_mut(*to) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*to);
                    }
                }
            }
        }
    }

    if order.len() < in_degree.len() {
        let mut remaining: Vec<NodeId> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.clone())
            .collect();
        remaining.sort();
        return Err(TopoError::Cycle { remaining });
    }
    Ok(order)
}

/// Sort nodes by the active blocking edges among them. Edges with an
/// endpoint outside `nodes` are ignored.
pub fn sort_nodes(nodes: Vec<Node>, edges: &[Edge]) -> Result<Vec<Node>, TopoError> {
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
    let members: BTreeSet<&NodeId> = ids.iter().collect();
    let pairs: Vec<(NodeId, NodeId)> = edges
        .iter()
        .filter(|e| e.is_active() && e.is_blocking())
        .filter(|e| members.contains(&e.from_node_id) && members.contains(&e.to_node_id))
        .map(|e| (e.from_node_id.clone(), e.to_node_id.clone()))
        .collect();
    let order = topo_sort(&ids, &pairs)?;

    let mut by_id: HashMap<NodeId, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    Ok(order.into_iter().filter_map(|id| by_id.remove(&id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from_string(s)
    }

    fn pair(a: &str, b: &str) -> (NodeId, NodeId) {
        (id(a), id(b))
    }

    #[test]
    fn test_sort_breaks_ties_by_id() {
        let nodes = vec![id("c"), id("a"), id("b"), id("d")];
        let edges = vec![pair("c", "d"), pair("a", "d")];
        let order = topo_sort(&nodes, &edges).unwrap();
        assert_eq!(order, vec![id("a"), id("b"), id("c"), id("d")]);
    }

    #[test]
    fn test_sort_is_stable_across_calls() {
        let nodes: Vec<NodeId> = ["e", "d", "c", "b", "a"].iter().map(|s| id(s)).collect();
        let edges = vec![pair("e", "a"), pair("d", "b"), pair("b", "a")];
        let first = topo_sort(&nodes, &edges).unwrap();
        for _ in 0..10 {
            assert_eq!(topo_sort(&nodes, &edges).unwrap(), first);
        }
        assert_eq!(first, vec![id("c"), id("d"), id("b"), id("e"), id("a")]);
    }

    #[test]
    fn test_cycle_is_distinguished() {
        let nodes = vec![id("a"), id("b"), id("c"), id("x")];
        let edges = vec![pair("a", "b"), pair("b", "c"), pair("c", "b")];
        let err = topo_sort(&nodes, &edges).unwrap_err();
        assert_eq!(
            err,
            TopoError::Cycle {
                remaining: vec![id("b"), id("c")]
            }
        );
        let converted: TrellisError = err.into();
        assert!(matches!(converted, TrellisError::GraphCycle(ids) if ids.len() == 2));
    }

    #[test]
    fn test_unknown_node() {
        let err = topo_sort(&[id("a")], &[pair("a", "zz")]).unwrap_err();
        assert_eq!(err, TopoError::UnknownNode(id("zz")));
    }

    #[test]
    fn test_parallel_edges_count_separately() {
        let nodes = vec![id("a"), id("b")];
        let edges = vec![pair("a", "b"), pair("a", "b")];
        assert_eq!(topo_sort(&nodes, &edges).unwrap(), vec![id("a"), id("b")]);
    }
}
