use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;

use crate::codec::*;
use crate::rows::GraphRows;

impl<'c> GraphRows<'c> {
    fn query_edges(&self, filter: &str, mut args: Vec<SqlValue>) -> Result<Vec<Edge>> {
        args.insert(0, SqlValue::Text(self.graph_id().0.clone()));
        let sql = format!("{} WHERE graph_id = ?1 AND ({}) ORDER BY id", EDGE_SELECT, filter);
        let mut stmt = self.conn().prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), edge_from_row)
            .map_err(db_err)?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row.map_err(db_err)?);
        }
        Ok(edges)
    }

    pub fn insert_edge(&self, edge: &Edge) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO edges (id, graph_id, from_node_id, to_node_id, edge_type, metadata,
                    compressed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    edge.id.as_str(),
                    self.graph_id().as_str(),
                    edge.from_node_id.as_str(),
                    edge.to_node_id.as_str(),
                    edge.edge_type.as_str(),
                    json_text(&edge.metadata),
                    edge.compressed_at.as_ref().map(ts),
                    ts(&edge.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// The edge for `(from, to, type)`, active or archived.
    pub fn find_edge(
        &self,
        from: &NodeId,
        to: &NodeId,
        edge_type: EdgeType,
    ) -> Result<Option<Edge>> {
        let sql = format!(
            "{} WHERE graph_id = ?1 AND from_node_id = ?2 AND to_node_id = ?3 AND edge_type = ?4",
            EDGE_SELECT
        );
        self.conn()
            .query_row(
                &sql,
                params![
                    self.graph_id().as_str(),
                    from.as_str(),
                    to.as_str(),
                    edge_type.as_str()
                ],
                edge_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn edge(&self, id: &EdgeId) -> Result<Edge> {
        self.query_edges("id = ?2", vec![SqlValue::Text(id.0.clone())])?
            .into_iter()
            .next()
            .ok_or_else(|| TrellisError::not_found("edge", id))
    }

    /// Every edge including archived ones.
    pub fn all_edges(&self) -> Result<Vec<Edge>> {
        self.query_edges("1 = 1", vec![])
    }

    pub fn active_edges(&self) -> Result<Vec<Edge>> {
        self.query_edges("compressed_at IS NULL", vec![])
    }

    pub fn active_blocking_edges(&self) -> Result<Vec<Edge>> {
        self.query_edges(
            "compressed_at IS NULL AND edge_type IN ('sequence', 'dependency')",
            vec![],
        )
    }

    /// Active edges with either endpoint in `ids`.
    pub fn active_edges_touching(&self, ids: &[NodeId]) -> Result<Vec<Edge>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = placeholders(ids.len(), 1);
        let filter = format!(
            "compressed_at IS NULL AND (from_node_id IN ({list}) OR to_node_id IN ({list}))",
            list = list
        );
        self.query_edges(&filter, ids.iter().map(|i| SqlValue::Text(i.0.clone())).collect())
    }

    pub fn active_incoming(&self, node: &NodeId) -> Result<Vec<Edge>> {
        self.query_edges(
            "compressed_at IS NULL AND to_node_id = ?2",
            vec![SqlValue::Text(node.0.clone())],
        )
    }

    pub fn active_outgoing(&self, node: &NodeId) -> Result<Vec<Edge>> {
        self.query_edges(
            "compressed_at IS NULL AND from_node_id = ?2",
            vec![SqlValue::Text(node.0.clone())],
        )
    }

    /// Active blocking edges among the given nodes.
    pub fn active_blocking_edges_within(&self, ids: &[NodeId]) -> Result<Vec<Edge>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = placeholders(ids.len(), 1);
        let filter = format!(
            "compressed_at IS NULL AND edge_type IN ('sequence', 'dependency')
             AND from_node_id IN ({list}) AND to_node_id IN ({list})",
            list = list
        );
        self.query_edges(&filter, ids.iter().map(|i| SqlValue::Text(i.0.clone())).collect())
    }

    /// Active blocking edges pointing at or out of an archived node. Branch
    /// edges are provenance and may legitimately start at archived nodes.
    pub fn dangling_edges(&self) -> Result<Vec<Edge>> {
        self.query_edges(
            "compressed_at IS NULL AND edge_type IN ('sequence', 'dependency') AND EXISTS (
                SELECT 1 FROM nodes n
                WHERE n.id IN (edges.from_node_id, edges.to_node_id)
                  AND n.compressed_at IS NOT NULL)",
            vec![],
        )
    }

    pub fn archive_edges(&self, ids: &[EdgeId], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE edges SET compressed_at = ?1
             WHERE graph_id = ?2 AND compressed_at IS NULL AND id IN ({})",
            placeholders(ids.len(), 2)
        );
        let mut args = vec![
            SqlValue::Text(ts(&at)),
            SqlValue::Text(self.graph_id().0.clone()),
        ];
        args.extend(ids.iter().map(|i| SqlValue::Text(i.0.clone())));
        self.conn()
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(db_err)
    }
}
