use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::*;

use crate::codec::*;

/// Graph-scoped row access over one connection or transaction.
///
/// Every query filters on the graph id, so rows from other graphs are never
/// visible and cross-graph references fail as "not found".
pub struct GraphRows<'c> {
    conn: &'c Connection,
    graph_id: GraphId,
}

/// Fields written together with a state transition.
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub at: DateTime<Utc>,
    pub error: Option<&'a str>,
    pub metadata: Option<&'a Map>,
    /// Output and its preview.
    pub output: Option<(&'a Map, &'a Map)>,
}

impl<'a> Transition<'a> {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            error: None,
            metadata: None,
            output: None,
        }
    }

    pub fn with_error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_metadata(mut self, metadata: &'a Map) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_output(mut self, output: &'a Map, preview: &'a Map) -> Self {
        self.output = Some((output, preview));
        self
    }
}

const BLOCKING_TYPES: &str = "('sequence', 'dependency')";
const FAILING_STATES: &str = "('errored', 'rejected', 'skipped', 'cancelled')";
const TERMINAL_STATES: &str = "('finished', 'errored', 'rejected', 'skipped', 'cancelled')";

impl<'c> GraphRows<'c> {
    pub fn new(conn: &'c Connection, graph_id: GraphId) -> Self {
        Self { conn, graph_id }
    }

    pub fn graph_id(&self) -> &GraphId {
        &self.graph_id
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    fn gid(&self) -> SqlValue {
        SqlValue::Text(self.graph_id.0.clone())
    }

    pub(crate) fn query_nodes(&self, filter: &str, mut args: Vec<SqlValue>) -> Result<Vec<Node>> {
        args.insert(0, self.gid());
        let sql = format!("{} WHERE n.graph_id = ?1 AND ({}) ORDER BY n.id", NODE_SELECT, filter);
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), node_from_row)
            .map_err(db_err)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.map_err(db_err)?);
        }
        Ok(nodes)
    }

    fn query_ids(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<NodeId>> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| Ok(NodeId(row.get(0)?)))
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    // ── Nodes ───────────────────────────────────────────────────────

    /// Insert a node and its body. Returns `false` when a uniqueness
    /// constraint (idempotency key) rejected the row.
    pub fn insert_node(&self, node: &Node) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO nodes (id, graph_id, node_type, state, body_kind, metadata, lane_id,
                turn_id, idempotency_key, retry_of_id, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                node.id.as_str(),
                self.graph_id.as_str(),
                node.node_type,
                node.state.as_str(),
                node.body_kind,
                json_text(&node.metadata),
                node.lane_id.as_ref().map(|l| l.as_str()),
                node.turn_id.as_ref().map(|t| t.as_str()),
                node.idempotency_key,
                node.retry_of_id.as_ref().map(|r| r.as_str()),
                node.error,
                ts(&node.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Ok(false),
            Err(e) => return Err(db_err(e)),
        }
        self.conn
            .execute(
                "INSERT INTO node_bodies (node_id, input, output, output_preview)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    node.id.as_str(),
                    json_text(&node.input),
                    json_text(&node.output),
                    json_text(&node.output_preview),
                ],
            )
            .map_err(db_err)?;
        if node.state.is_terminal() {
            self.conn
                .execute(
                    "UPDATE nodes SET finished_at = ?1 WHERE id = ?2",
                    params![ts(&node.created_at), node.id.as_str()],
                )
                .map_err(db_err)?;
        }
        Ok(true)
    }

    pub fn find_node(&self, id: &NodeId) -> Result<Option<Node>> {
        let sql = format!("{} WHERE n.id = ?1 AND n.graph_id = ?2", NODE_SELECT);
        self.conn
            .query_row(&sql, params![id.as_str(), self.graph_id.as_str()], node_from_row)
            .optional()
            .map_err(db_err)
    }

    pub fn node(&self, id: &NodeId) -> Result<Node> {
        self.find_node(id)?
            .ok_or_else(|| TrellisError::not_found("node", id))
    }

    /// Nodes with the given ids, in id order. Missing ids are skipped.
    pub fn nodes_by_ids(&self, ids: &[NodeId]) -> Result<Vec<Node>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!("n.id IN ({})", placeholders(ids.len(), 1));
        self.query_nodes(&filter, ids.iter().map(|i| SqlValue::Text(i.0.clone())).collect())
    }

    pub fn find_by_idempotency_key(
        &self,
        turn_id: Option<&TurnId>,
        node_type: &str,
        key: &str,
    ) -> Result<Option<Node>> {
        let nodes = self.query_nodes(
            "IFNULL(n.turn_id, '') = ?2 AND n.node_type = ?3 AND n.idempotency_key = ?4",
            vec![
                SqlValue::Text(turn_id.map(|t| t.0.clone()).unwrap_or_default()),
                SqlValue::Text(node_type.to_string()),
                SqlValue::Text(key.to_string()),
            ],
        )?;
        Ok(nodes.into_iter().next())
    }

    /// Every node including archived ones.
    pub fn all_nodes(&self) -> Result<Vec<Node>> {
        self.query_nodes("1 = 1", vec![])
    }

    pub fn active_nodes(&self) -> Result<Vec<Node>> {
        self.query_nodes("n.compressed_at IS NULL", vec![])
    }

    pub fn active_nodes_in_state(&self, state: NodeState) -> Result<Vec<Node>> {
        self.query_nodes(
            "n.compressed_at IS NULL AND n.state = ?2",
            vec![SqlValue::Text(state.as_str().into())],
        )
    }

    pub fn active_nodes_in_turns(&self, turn_ids: &[TurnId]) -> Result<Vec<Node>> {
        if turn_ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!(
            "n.compressed_at IS NULL AND n.turn_id IN ({})",
            placeholders(turn_ids.len(), 1)
        );
        self.query_nodes(
            &filter,
            turn_ids.iter().map(|t| SqlValue::Text(t.0.clone())).collect(),
        )
    }

    /// Active nodes of the given types in the given lanes, newest first.
    pub fn active_nodes_of_types(
        &self,
        node_types: &[String],
        lane_ids: &[LaneId],
    ) -> Result<Vec<Node>> {
        if node_types.is_empty() || lane_ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!(
            "n.compressed_at IS NULL AND n.node_type IN ({}) AND n.lane_id IN ({})",
            placeholders(node_types.len(), 1),
            placeholders(lane_ids.len(), 1 + node_types.len()),
        );
        let mut args: Vec<SqlValue> = node_types.iter().map(|t| SqlValue::Text(t.clone())).collect();
        args.extend(lane_ids.iter().map(|l| SqlValue::Text(l.0.clone())));
        let mut nodes = self.query_nodes(&filter, args)?;
        nodes.reverse();
        Ok(nodes)
    }

    pub fn count_in_state(&self, state: NodeState) -> Result<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM nodes WHERE graph_id = ?1 AND state = ?2",
                params![self.graph_id.as_str(), state.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err)
    }

    /// Pending active nodes whose blocking predecessors have settled:
    /// every dependency predecessor finished, every sequence predecessor
    /// terminal.
    pub fn ready_pending_nodes(&self) -> Result<Vec<Node>> {
        let filter = format!(
            "n.compressed_at IS NULL AND n.state = 'pending' AND n.claimed_at IS NULL
             AND NOT EXISTS (
                SELECT 1 FROM edges e JOIN nodes p ON p.id = e.from_node_id
                WHERE e.to_node_id = n.id AND e.compressed_at IS NULL
                  AND ((e.edge_type = 'dependency' AND p.state != 'finished')
                    OR (e.edge_type = 'sequence' AND p.state NOT IN {terminal})))",
            terminal = TERMINAL_STATES
        );
        self.query_nodes(&filter, vec![])
    }

    /// Pending active nodes with at least one failed dependency predecessor,
    /// paired with those predecessors.
    pub fn pending_blocked_by_failures(&self) -> Result<Vec<(NodeId, String, Vec<NodeId>)>> {
        let sql = format!(
            "SELECT n.id, n.node_type, p.id FROM nodes n
             JOIN edges e ON e.to_node_id = n.id AND e.compressed_at IS NULL
                AND e.edge_type = 'dependency'
             JOIN nodes p ON p.id = e.from_node_id AND p.state IN {failing}
             WHERE n.graph_id = ?1 AND n.state = 'pending' AND n.compressed_at IS NULL
             ORDER BY n.id, p.id",
            failing = FAILING_STATES
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.graph_id.as_str()], |row| {
                Ok((
                    NodeId(row.get(0)?),
                    row.get::<_, String>(1)?,
                    NodeId(row.get(2)?),
                ))
            })
            .map_err(db_err)?;
        let mut out: Vec<(NodeId, String, Vec<NodeId>)> = Vec::new();
        for row in rows {
            let (id, node_type, pred) = row.map_err(db_err)?;
            match out.last_mut() {
                Some(last) if last.0 == id => last.2.push(pred),
                _ => out.push((id, node_type, vec![pred])),
            }
        }
        Ok(out)
    }

    /// Atomic conditional state change. Returns `false` when the node was not
    /// in one of the `from` states, which leaves the row untouched.
    pub fn transition(
        &self,
        id: &NodeId,
        from: &[NodeState],
        to: NodeState,
        change: &Transition<'_>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let terminal = to.is_terminal();
        let sql = format!(
            "UPDATE nodes SET state = ?1,
                error = COALESCE(?2, error),
                metadata = COALESCE(?3, metadata),
                finished_at = CASE WHEN ?4 THEN ?5 ELSE finished_at END,
                lease_expires_at = CASE WHEN ?4 THEN NULL ELSE lease_expires_at END
             WHERE id = ?6 AND graph_id = ?7 AND state IN ({})",
            placeholders(from.len(), 7)
        );
        let mut args: Vec<SqlValue> = vec![
            SqlValue::Text(to.as_str().into()),
            change.error.map_or(SqlValue::Null, |e| SqlValue::Text(e.into())),
            change
                .metadata
                .map_or(SqlValue::Null, |m| SqlValue::Text(json_text(m))),
            SqlValue::Integer(terminal as i64),
            SqlValue::Text(ts(&change.at)),
            SqlValue::Text(id.0.clone()),
            self.gid(),
        ];
        args.extend(from.iter().map(|s| SqlValue::Text(s.as_str().into())));
        let changed = self
            .conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(db_err)?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some((output, preview)) = change.output {
            self.update_output(id, output, preview)?;
        }
        Ok(true)
    }

    pub fn update_output(&self, id: &NodeId, output: &Map, preview: &Map) -> Result<()> {
        self.conn
            .execute(
                "UPDATE node_bodies SET output = ?1, output_preview = ?2 WHERE node_id = ?3",
                params![json_text(output), json_text(preview), id.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_metadata(&self, id: &NodeId, metadata: &Map) -> Result<()> {
        self.conn
            .execute(
                "UPDATE nodes SET metadata = ?1 WHERE id = ?2 AND graph_id = ?3",
                params![json_text(metadata), id.as_str(), self.graph_id.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Lease a pending node to `worker`. Exactly one of several racing
    /// claimers sees `true`.
    pub fn claim(
        &self,
        id: &NodeId,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE nodes SET state = 'running', claimed_at = ?1, claimed_by = ?2,
                    lease_expires_at = ?3, heartbeat_at = ?1, started_at = ?1
                 WHERE id = ?4 AND graph_id = ?5 AND state = 'pending' AND claimed_at IS NULL",
                params![
                    ts(&now),
                    worker,
                    ts(&lease_until),
                    id.as_str(),
                    self.graph_id.as_str()
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Extend a live lease held by `worker`.
    pub fn heartbeat(
        &self,
        id: &NodeId,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE nodes SET heartbeat_at = ?1, lease_expires_at = ?2
                 WHERE id = ?3 AND graph_id = ?4 AND state = 'running'
                   AND claimed_by = ?5 AND lease_expires_at > ?1",
                params![
                    ts(&now),
                    ts(&lease_until),
                    id.as_str(),
                    self.graph_id.as_str(),
                    worker
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Running nodes whose lease ran out before `now`.
    pub fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Node>> {
        self.query_nodes(
            "n.state = 'running' AND (n.lease_expires_at IS NULL OR n.lease_expires_at <= ?2)",
            vec![SqlValue::Text(ts(&now))],
        )
    }

    /// Soft-archive nodes, attributing the archival to `by`.
    pub fn archive_nodes(
        &self,
        ids: &[NodeId],
        at: DateTime<Utc>,
        by: Option<&NodeId>,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE nodes SET compressed_at = ?1, compressed_by_id = ?2
             WHERE graph_id = ?3 AND compressed_at IS NULL AND id IN ({})",
            placeholders(ids.len(), 3)
        );
        let mut args = vec![
            SqlValue::Text(ts(&at)),
            by.map_or(SqlValue::Null, |b| SqlValue::Text(b.0.clone())),
            self.gid(),
        ];
        args.extend(ids.iter().map(|i| SqlValue::Text(i.0.clone())));
        self.conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(db_err)
    }

    /// `Some(true)` stamps the flag, `Some(false)` clears it, `None` keeps it.
    pub fn set_visibility(
        &self,
        id: &NodeId,
        context_excluded: Option<bool>,
        deleted: Option<bool>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let stamp = |flag: Option<bool>| match flag {
            Some(true) => SqlValue::Text(ts(&at)),
            _ => SqlValue::Null,
        };
        let args = vec![
            SqlValue::Integer(context_excluded.is_some() as i64),
            stamp(context_excluded),
            SqlValue::Integer(deleted.is_some() as i64),
            stamp(deleted),
            SqlValue::Text(id.0.clone()),
            self.gid(),
        ];
        self.conn
            .execute(
                "UPDATE nodes SET
                    context_excluded_at = CASE WHEN ?1 THEN ?2 ELSE context_excluded_at END,
                    deleted_at = CASE WHEN ?3 THEN ?4 ELSE deleted_at END
                 WHERE id = ?5 AND graph_id = ?6",
                params_from_iter(args.iter()),
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── Traversal ───────────────────────────────────────────────────

    /// Whether `to` is reachable from `from` over active blocking edges.
    pub fn reaches(&self, from: &NodeId, to: &NodeId) -> Result<bool> {
        let sql = format!(
            "WITH RECURSIVE reach(id) AS (
                SELECT ?1
                UNION
                SELECT e.to_node_id FROM edges e JOIN reach r ON e.from_node_id = r.id
                WHERE e.graph_id = ?3 AND e.compressed_at IS NULL
                  AND e.edge_type IN {blocking}
             )
             SELECT EXISTS(SELECT 1 FROM reach WHERE id = ?2)",
            blocking = BLOCKING_TYPES
        );
        self.conn
            .query_row(
                &sql,
                params![from.as_str(), to.as_str(), self.graph_id.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .map_err(db_err)
    }

    /// Target plus every active ancestor over active blocking edges.
    pub fn ancestor_ids(&self, target: &NodeId) -> Result<Vec<NodeId>> {
        let sql = format!(
            "WITH RECURSIVE anc(id) AS (
                SELECT ?1
                UNION
                SELECT e.from_node_id FROM edges e
                JOIN anc a ON e.to_node_id = a.id
                JOIN nodes p ON p.id = e.from_node_id
                WHERE e.graph_id = ?2 AND e.compressed_at IS NULL
                  AND e.edge_type IN {blocking} AND p.compressed_at IS NULL
             )
             SELECT id FROM anc ORDER BY id",
            blocking = BLOCKING_TYPES
        );
        self.query_ids(
            &sql,
            vec![SqlValue::Text(target.0.clone()), self.gid()],
        )
    }

    /// Every active node reachable from `node` over active blocking edges,
    /// excluding `node` itself.
    pub fn descendant_ids(&self, node: &NodeId) -> Result<Vec<NodeId>> {
        let sql = format!(
            "WITH RECURSIVE des(id) AS (
                SELECT ?1
                UNION
                SELECT e.to_node_id FROM edges e
                JOIN des d ON e.from_node_id = d.id
                JOIN nodes c ON c.id = e.to_node_id
                WHERE e.graph_id = ?2 AND e.compressed_at IS NULL
                  AND e.edge_type IN {blocking} AND c.compressed_at IS NULL
             )
             SELECT id FROM des WHERE id != ?1 ORDER BY id",
            blocking = BLOCKING_TYPES
        );
        self.query_ids(&sql, vec![SqlValue::Text(node.0.clone()), self.gid()])
    }

    /// Active nodes without outgoing active blocking edges.
    pub fn leaves(&self) -> Result<Vec<Node>> {
        let filter = format!(
            "n.compressed_at IS NULL AND NOT EXISTS (
                SELECT 1 FROM edges e WHERE e.from_node_id = n.id
                  AND e.compressed_at IS NULL AND e.edge_type IN {blocking})",
            blocking = BLOCKING_TYPES
        );
        self.query_nodes(&filter, vec![])
    }
}
