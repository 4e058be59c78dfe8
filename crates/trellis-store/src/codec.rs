//! Row <-> type conversions shared by the row modules.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ErrorCode, Row};

use trellis_core::error::TrellisError;
use trellis_core::types::*;

pub(crate) const NODE_SELECT: &str = "SELECT n.id, n.graph_id, n.node_type, n.state, n.body_kind,
        b.input, b.output, b.output_preview, n.metadata, n.lane_id, n.turn_id,
        n.idempotency_key, n.retry_of_id, n.error, n.compressed_at, n.compressed_by_id,
        n.context_excluded_at, n.deleted_at, n.claimed_at, n.claimed_by,
        n.lease_expires_at, n.heartbeat_at, n.started_at, n.finished_at, n.created_at
    FROM nodes n LEFT JOIN node_bodies b ON b.node_id = n.id";

pub(crate) const EDGE_SELECT: &str = "SELECT id, graph_id, from_node_id, to_node_id, edge_type,
        metadata, compressed_at, created_at
    FROM edges";

pub(crate) const LANE_SELECT: &str = "SELECT id, graph_id, role, name, parent_lane_id,
        forked_from_node_id, root_node_id, merged_into_lane_id, archived_at, created_at
    FROM lanes";

pub(crate) const TURN_SELECT: &str =
    "SELECT id, graph_id, lane_id, seq, anchor_node_id, created_at FROM turns";

pub(crate) fn db_err(e: impl std::fmt::Display) -> TrellisError {
    TrellisError::Database(e.to_string())
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

pub(crate) fn ts_req(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn json_map(raw: String) -> Map {
    serde_json::from_str(&raw).unwrap_or_default()
}

pub(crate) fn json_text(map: &Map) -> String {
    serde_json::Value::Object(map.clone()).to_string()
}

fn conversion_err(idx: usize, e: TrellisError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let state: String = row.get(3)?;
    Ok(Node {
        id: NodeId(row.get(0)?),
        graph_id: GraphId(row.get(1)?),
        node_type: row.get(2)?,
        state: state.parse().map_err(|e| conversion_err(3, e))?,
        body_kind: row.get(4)?,
        input: json_map(row.get::<_, Option<String>>(5)?.unwrap_or_default()),
        output: json_map(row.get::<_, Option<String>>(6)?.unwrap_or_default()),
        output_preview: json_map(row.get::<_, Option<String>>(7)?.unwrap_or_default()),
        metadata: json_map(row.get(8)?),
        lane_id: row.get::<_, Option<String>>(9)?.map(LaneId),
        turn_id: row.get::<_, Option<String>>(10)?.map(TurnId),
        idempotency_key: row.get(11)?,
        retry_of_id: row.get::<_, Option<String>>(12)?.map(NodeId),
        error: row.get(13)?,
        compressed_at: ts_opt(row.get(14)?),
        compressed_by_id: row.get::<_, Option<String>>(15)?.map(NodeId),
        context_excluded_at: ts_opt(row.get(16)?),
        deleted_at: ts_opt(row.get(17)?),
        claimed_at: ts_opt(row.get(18)?),
        claimed_by: row.get(19)?,
        lease_expires_at: ts_opt(row.get(20)?),
        heartbeat_at: ts_opt(row.get(21)?),
        started_at: ts_opt(row.get(22)?),
        finished_at: ts_opt(row.get(23)?),
        created_at: ts_req(row.get(24)?),
    })
}

pub(crate) fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    let edge_type: String = row.get(4)?;
    Ok(Edge {
        id: EdgeId(row.get(0)?),
        graph_id: GraphId(row.get(1)?),
        from_node_id: NodeId(row.get(2)?),
        to_node_id: NodeId(row.get(3)?),
        edge_type: edge_type.parse().map_err(|e| conversion_err(4, e))?,
        metadata: json_map(row.get(5)?),
        compressed_at: ts_opt(row.get(6)?),
        created_at: ts_req(row.get(7)?),
    })
}

pub(crate) fn lane_from_row(row: &Row<'_>) -> rusqlite::Result<Lane> {
    let role: String = row.get(2)?;
    Ok(Lane {
        id: LaneId(row.get(0)?),
        graph_id: GraphId(row.get(1)?),
        role: role.parse().map_err(|e| conversion_err(2, e))?,
        name: row.get(3)?,
        parent_lane_id: row.get::<_, Option<String>>(4)?.map(LaneId),
        forked_from_node_id: row.get::<_, Option<String>>(5)?.map(NodeId),
        root_node_id: row.get::<_, Option<String>>(6)?.map(NodeId),
        merged_into_lane_id: row.get::<_, Option<String>>(7)?.map(LaneId),
        archived_at: ts_opt(row.get(8)?),
        created_at: ts_req(row.get(9)?),
    })
}

pub(crate) fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    Ok(Turn {
        id: TurnId(row.get(0)?),
        graph_id: GraphId(row.get(1)?),
        lane_id: LaneId(row.get(2)?),
        seq: row.get(3)?,
        anchor_node_id: row.get::<_, Option<String>>(4)?.map(NodeId),
        created_at: ts_req(row.get(5)?),
    })
}

/// `?2, ?3, ...` placeholders for an IN list starting after `offset` params.
pub(crate) fn placeholders(count: usize, offset: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", i + offset + 1))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(ts(&a) < ts(&b));
        assert_eq!(ts(&a).len(), ts(&b).len());
        assert_eq!(ts_opt(Some(ts(&b))), Some(b));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3, 1), "?2, ?3, ?4");
        assert_eq!(placeholders(0, 0), "");
    }
}
