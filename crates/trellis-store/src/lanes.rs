use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;

use crate::codec::*;
use crate::rows::GraphRows;

impl<'c> GraphRows<'c> {
    // ── Lanes ───────────────────────────────────────────────────────

    pub fn insert_lane(&self, lane: &Lane) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO lanes (id, graph_id, role, name, parent_lane_id, forked_from_node_id,
                    root_node_id, merged_into_lane_id, archived_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    lane.id.as_str(),
                    self.graph_id().as_str(),
                    lane.role.as_str(),
                    lane.name,
                    lane.parent_lane_id.as_ref().map(|l| l.as_str()),
                    lane.forked_from_node_id.as_ref().map(|n| n.as_str()),
                    lane.root_node_id.as_ref().map(|n| n.as_str()),
                    lane.merged_into_lane_id.as_ref().map(|l| l.as_str()),
                    lane.archived_at.as_ref().map(ts),
                    ts(&lane.created_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    TrellisError::Validation(format!(
                        "graph {} already has a main lane",
                        self.graph_id()
                    ))
                } else {
                    db_err(e)
                }
            })?;
        Ok(())
    }

    pub fn find_lane(&self, id: &LaneId) -> Result<Option<Lane>> {
        let sql = format!("{} WHERE id = ?1 AND graph_id = ?2", LANE_SELECT);
        self.conn()
            .query_row(&sql, params![id.as_str(), self.graph_id().as_str()], lane_from_row)
            .optional()
            .map_err(db_err)
    }

    pub fn lane(&self, id: &LaneId) -> Result<Lane> {
        self.find_lane(id)?
            .ok_or_else(|| TrellisError::not_found("lane", id))
    }

    pub fn main_lane(&self) -> Result<Option<Lane>> {
        let sql = format!("{} WHERE graph_id = ?1 AND role = 'main'", LANE_SELECT);
        self.conn()
            .query_row(&sql, params![self.graph_id().as_str()], lane_from_row)
            .optional()
            .map_err(db_err)
    }

    pub fn lanes(&self) -> Result<Vec<Lane>> {
        let sql = format!("{} WHERE graph_id = ?1 ORDER BY id", LANE_SELECT);
        let mut stmt = self.conn().prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.graph_id().as_str()], lane_from_row)
            .map_err(db_err)?;
        let mut lanes = Vec::new();
        for row in rows {
            lanes.push(row.map_err(db_err)?);
        }
        Ok(lanes)
    }

    pub fn archive_lane(&self, id: &LaneId, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE lanes SET archived_at = ?1
                 WHERE id = ?2 AND graph_id = ?3 AND archived_at IS NULL",
                params![ts(&at), id.as_str(), self.graph_id().as_str()],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    pub fn set_lane_merged(&self, id: &LaneId, into: &LaneId, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE lanes SET merged_into_lane_id = ?1, archived_at = COALESCE(archived_at, ?2)
                 WHERE id = ?3 AND graph_id = ?4",
                params![into.as_str(), ts(&at), id.as_str(), self.graph_id().as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_lane_root(&self, id: &LaneId, root: &NodeId) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE lanes SET root_node_id = ?1 WHERE id = ?2 AND graph_id = ?3",
                params![root.as_str(), id.as_str(), self.graph_id().as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── Turns ───────────────────────────────────────────────────────

    /// Insert a turn at the end of `lane_id`, assigning the next sequence number.
    pub fn insert_turn(&self, lane_id: &LaneId, at: DateTime<Utc>) -> Result<Turn> {
        let seq: i64 = self
            .conn()
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE lane_id = ?1",
                params![lane_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let turn = Turn {
            id: TurnId::new(),
            graph_id: self.graph_id().clone(),
            lane_id: lane_id.clone(),
            seq,
            anchor_node_id: None,
            created_at: at,
        };
        self.conn()
            .execute(
                "INSERT INTO turns (id, graph_id, lane_id, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    turn.id.as_str(),
                    self.graph_id().as_str(),
                    lane_id.as_str(),
                    seq,
                    ts(&at)
                ],
            )
            .map_err(db_err)?;
        Ok(turn)
    }

    pub fn find_turn(&self, id: &TurnId) -> Result<Option<Turn>> {
        let sql = format!("{} WHERE id = ?1 AND graph_id = ?2", TURN_SELECT);
        self.conn()
            .query_row(&sql, params![id.as_str(), self.graph_id().as_str()], turn_from_row)
            .optional()
            .map_err(db_err)
    }

    pub fn turn(&self, id: &TurnId) -> Result<Turn> {
        self.find_turn(id)?
            .ok_or_else(|| TrellisError::not_found("turn", id))
    }

    /// Record the first node created in a turn as its anchor.
    pub fn anchor_turn(&self, id: &TurnId, node: &NodeId) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE turns SET anchor_node_id = ?1
                 WHERE id = ?2 AND graph_id = ?3 AND anchor_node_id IS NULL",
                params![node.as_str(), id.as_str(), self.graph_id().as_str()],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Move anchors pointing at a replaced node to its replacement.
    pub fn reanchor_turns(&self, from: &NodeId, to: &NodeId) -> Result<usize> {
        self.conn()
            .execute(
                "UPDATE turns SET anchor_node_id = ?1 WHERE graph_id = ?2 AND anchor_node_id = ?3",
                params![to.as_str(), self.graph_id().as_str(), from.as_str()],
            )
            .map_err(db_err)
    }

    /// Turns of a lane whose anchor node is active, newest first, optionally
    /// capped at `max_seq`.
    pub fn anchored_turns(
        &self,
        lane_id: &LaneId,
        max_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Turn>> {
        let sql = "SELECT t.id, t.graph_id, t.lane_id, t.seq, t.anchor_node_id, t.created_at
             FROM turns t JOIN nodes a ON a.id = t.anchor_node_id
             WHERE t.graph_id = ?1 AND t.lane_id = ?2 AND a.compressed_at IS NULL
               AND (?3 IS NULL OR t.seq <= ?3)
             ORDER BY t.seq DESC LIMIT ?4";
        let args = vec![
            SqlValue::Text(self.graph_id().0.clone()),
            SqlValue::Text(lane_id.0.clone()),
            max_seq.map_or(SqlValue::Null, SqlValue::Integer),
            SqlValue::Integer(limit as i64),
        ];
        let mut stmt = self.conn().prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), turn_from_row)
            .map_err(db_err)?;
        let mut turns = Vec::new();
        for row in rows {
            turns.push(row.map_err(db_err)?);
        }
        Ok(turns)
    }
}
