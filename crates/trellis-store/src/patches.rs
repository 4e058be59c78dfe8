use chrono::{DateTime, Utc};
use rusqlite::params;

use trellis_core::error::Result;
use trellis_core::types::*;

use crate::codec::*;
use crate::rows::GraphRows;

fn flag(raw: Option<i64>) -> Option<bool> {
    raw.map(|v| v != 0)
}

impl<'c> GraphRows<'c> {
    // ── Visibility patches ──────────────────────────────────────────

    /// Enqueue a visibility change, merging into any existing patch for the
    /// node. Flags left as `None` keep the previously requested value.
    pub fn upsert_patch(
        &self,
        node_id: &NodeId,
        context_excluded: Option<bool>,
        deleted: Option<bool>,
        at: DateTime<Utc>,
    ) -> Result<VisibilityPatch> {
        self.conn()
            .execute(
                "INSERT INTO visibility_patches
                    (node_id, graph_id, context_excluded, deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(node_id) DO UPDATE SET
                    context_excluded = COALESCE(excluded.context_excluded, context_excluded),
                    deleted = COALESCE(excluded.deleted, deleted),
                    updated_at = excluded.updated_at",
                params![
                    node_id.as_str(),
                    self.graph_id().as_str(),
                    context_excluded.map(|b| b as i64),
                    deleted.map(|b| b as i64),
                    ts(&at),
                ],
            )
            .map_err(db_err)?;
        self.conn()
            .query_row(
                "SELECT node_id, graph_id, context_excluded, deleted, created_at, updated_at
                 FROM visibility_patches WHERE node_id = ?1",
                params![node_id.as_str()],
                patch_from_row,
            )
            .map_err(db_err)
    }

    pub fn patches(&self) -> Result<Vec<VisibilityPatch>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT node_id, graph_id, context_excluded, deleted, created_at, updated_at
                 FROM visibility_patches WHERE graph_id = ?1 ORDER BY created_at, node_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.graph_id().as_str()], patch_from_row)
            .map_err(db_err)?;
        let mut patches = Vec::new();
        for row in rows {
            patches.push(row.map_err(db_err)?);
        }
        Ok(patches)
    }

    pub fn delete_patch(&self, node_id: &NodeId) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM visibility_patches WHERE node_id = ?1 AND graph_id = ?2",
                params![node_id.as_str(), self.graph_id().as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── Node events ─────────────────────────────────────────────────

    pub fn append_node_event(
        &self,
        node_id: &NodeId,
        kind: NodeEventKind,
        text: &str,
        payload: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO node_events (graph_id, node_id, kind, text, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    self.graph_id().as_str(),
                    node_id.as_str(),
                    kind.as_str(),
                    text,
                    payload.to_string(),
                    ts(&at),
                ],
            )
            .map_err(db_err)?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Events of a node in append order.
    pub fn node_events(&self, node_id: &NodeId) -> Result<Vec<NodeEvent>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT id, graph_id, node_id, kind, text, payload, created_at
                 FROM node_events WHERE graph_id = ?1 AND node_id = ?2 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.graph_id().as_str(), node_id.as_str()], |row| {
                let kind: String = row.get(3)?;
                let payload: String = row.get(5)?;
                Ok(NodeEvent {
                    id: row.get(0)?,
                    graph_id: GraphId(row.get(1)?),
                    node_id: NodeId(row.get(2)?),
                    kind: kind.parse().unwrap_or(NodeEventKind::Log),
                    text: row.get(4)?,
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                    created_at: ts_req(row.get(6)?),
                })
            })
            .map_err(db_err)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(db_err)?);
        }
        Ok(events)
    }

    /// Replace every event of `kind` for the node with a single event.
    pub fn replace_node_events(
        &self,
        node_id: &NodeId,
        kind: NodeEventKind,
        text: &str,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM node_events WHERE graph_id = ?1 AND node_id = ?2 AND kind = ?3",
                params![self.graph_id().as_str(), node_id.as_str(), kind.as_str()],
            )
            .map_err(db_err)?;
        self.append_node_event(node_id, kind, text, &serde_json::Value::Null, at)?;
        Ok(removed)
    }
}

fn patch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VisibilityPatch> {
    Ok(VisibilityPatch {
        node_id: NodeId(row.get(0)?),
        graph_id: GraphId(row.get(1)?),
        context_excluded: flag(row.get(2)?),
        deleted: flag(row.get(3)?),
        created_at: ts_req(row.get(4)?),
        updated_at: ts_req(row.get(5)?),
    })
}
