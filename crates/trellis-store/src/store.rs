use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{Graph, GraphId, Map};

use crate::codec::{db_err, json_map, ts, ts_req};
use crate::rows::GraphRows;
use crate::schema::SCHEMA;

/// In-process advisory locks, one per graph.
#[derive(Default)]
struct GraphLocks {
    locks: Mutex<HashMap<GraphId, Arc<Mutex<()>>>>,
}

impl GraphLocks {
    fn get(&self, graph_id: &GraphId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|e| db_err(e.to_string()))?;
        Ok(locks
            .entry(graph_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn forget(&self, graph_id: &GraphId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(graph_id);
        }
    }
}

/// SQLite-backed graph store.
///
/// Structural mutation goes through [`SqliteStore::with_graph_lock`], which
/// serializes mutators per graph (advisory lock keyed on the graph id) and
/// runs the closure in an immediate transaction that first touches the graph
/// row, so writers in other processes are serialized by SQLite as well.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    locks: GraphLocks,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_millis(5_000))
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrellisError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(busy_timeout).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;

        let store = Self::init(conn)?;
        debug!(path = %path.display(), "Graph store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: GraphLocks::default(),
        })
    }

    /// Create an empty graph.
    pub fn create_graph(&self, metadata: Map) -> Result<Graph> {
        let id = GraphId::new();
        let graph = Graph {
            lock_key: lock_key(&id),
            id,
            metadata,
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().map_err(|e| db_err(e.to_string()))?;
        conn.execute(
            "INSERT INTO graphs (id, lock_key, metadata, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                graph.id.as_str(),
                graph.lock_key,
                serde_json::Value::Object(graph.metadata.clone()).to_string(),
                ts(&graph.created_at),
            ],
        )
        .map_err(db_err)?;
        debug!(graph_id = %graph.id, "Graph created");
        Ok(graph)
    }

    pub fn find_graph(&self, graph_id: &GraphId) -> Result<Option<Graph>> {
        let conn = self.conn.lock().map_err(|e| db_err(e.to_string()))?;
        conn.query_row(
            "SELECT id, lock_key, metadata, created_at FROM graphs WHERE id = ?1",
            params![graph_id.as_str()],
            |row| {
                Ok(Graph {
                    id: GraphId(row.get(0)?),
                    lock_key: row.get(1)?,
                    metadata: json_map(row.get::<_, String>(2)?),
                    created_at: ts_req(row.get::<_, String>(3)?),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    pub fn graph_ids(&self) -> Result<Vec<GraphId>> {
        self.graph_ids_where("SELECT id FROM graphs ORDER BY id", None)
    }

    /// Graphs holding a running node whose lease ran out before `now`.
    pub fn graphs_with_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<GraphId>> {
        self.graph_ids_where(
            "SELECT DISTINCT graph_id FROM nodes
             WHERE state = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
             ORDER BY graph_id",
            Some(ts(&now)),
        )
    }

    /// Graphs with queued visibility patches.
    pub fn graphs_with_patches(&self) -> Result<Vec<GraphId>> {
        self.graph_ids_where(
            "SELECT DISTINCT graph_id FROM visibility_patches ORDER BY graph_id",
            None,
        )
    }

    fn graph_ids_where(&self, sql: &str, arg: Option<String>) -> Result<Vec<GraphId>> {
        let conn = self.conn.lock().map_err(|e| db_err(e.to_string()))?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<GraphId> { Ok(GraphId(row.get(0)?)) };
        let rows = match arg {
            Some(arg) => stmt.query_map(params![arg], map),
            None => stmt.query_map([], map),
        }
        .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    /// Purge a graph and every row it owns.
    pub fn destroy_graph(&self, graph_id: &GraphId) -> Result<bool> {
        let lock = self.locks.get(graph_id)?;
        let _guard = lock.lock().map_err(|e| db_err(e.to_string()))?;
        let conn = self.conn.lock().map_err(|e| db_err(e.to_string()))?;
        let deleted = conn
            .execute("DELETE FROM graphs WHERE id = ?1", params![graph_id.as_str()])
            .map_err(db_err)?;
        drop(conn);
        self.locks.forget(graph_id);
        debug!(graph_id = %graph_id, deleted, "Graph destroyed");
        Ok(deleted > 0)
    }

    /// Run `f` as the only mutator of `graph_id`, blocking until the graph
    /// lock is free. Commits when `f` succeeds, rolls back otherwise.
    pub fn with_graph_lock<T>(
        &self,
        graph_id: &GraphId,
        f: impl FnOnce(&GraphRows<'_>) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.get(graph_id)?;
        let _guard = lock.lock().map_err(|e| db_err(e.to_string()))?;
        self.locked_transaction(graph_id, f)
    }

    /// Like [`Self::with_graph_lock`] but fails fast with `LockBusy` instead
    /// of waiting for another mutator.
    pub fn try_with_graph_lock<T>(
        &self,
        graph_id: &GraphId,
        f: impl FnOnce(&GraphRows<'_>) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.get(graph_id)?;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(TrellisError::LockBusy(graph_id.to_string()))
            }
            Err(TryLockError::Poisoned(e)) => return Err(db_err(e.to_string())),
        };
        self.locked_transaction(graph_id, f)
    }

    fn locked_transaction<T>(
        &self,
        graph_id: &GraphId,
        f: impl FnOnce(&GraphRows<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|e| db_err(e.to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        // Row lock on the graph record.
        let touched = tx
            .execute(
                "UPDATE graphs SET lock_version = lock_version + 1 WHERE id = ?1",
                params![graph_id.as_str()],
            )
            .map_err(db_err)?;
        if touched == 0 {
            return Err(TrellisError::not_found("graph", graph_id));
        }

        let out = f(&GraphRows::new(&tx, graph_id.clone()))?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Unlocked access to a graph's rows, for reads and single conditional
    /// updates (claims, heartbeats) that are race-safe on their own.
    pub fn read<T>(
        &self,
        graph_id: &GraphId,
        f: impl FnOnce(&GraphRows<'_>) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().map_err(|e| db_err(e.to_string()))?;
        f(&GraphRows::new(&conn, graph_id.clone()))
    }
}

/// Stable 63-bit FNV-1a hash of the graph id.
pub fn lock_key(graph_id: &GraphId) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in graph_id.as_str().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash >> 1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_and_find_graph() {
        let store = SqliteStore::in_memory().unwrap();
        let graph = store.create_graph(Map::new()).unwrap();
        let found = store.find_graph(&graph.id).unwrap().unwrap();
        assert_eq!(found.id, graph.id);
        assert_eq!(found.lock_key, lock_key(&graph.id));
        assert_eq!(store.graph_ids().unwrap(), vec![graph.id]);
    }

    #[test]
    fn test_lock_key_is_stable() {
        let id = GraphId::from_string("graph-1");
        assert_eq!(lock_key(&id), lock_key(&GraphId::from_string("graph-1")));
        assert_ne!(lock_key(&id), lock_key(&GraphId::from_string("graph-2")));
        assert!(lock_key(&id) >= 0);
    }

    #[test]
    fn test_graph_lock_unknown_graph() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .with_graph_lock(&GraphId::new(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, TrellisError::NotFound { kind: "graph", .. }));
    }

    #[test]
    fn test_graph_lock_rolls_back_on_error() {
        let store = SqliteStore::in_memory().unwrap();
        let graph = store.create_graph(Map::new()).unwrap();
        let result: Result<()> = store.with_graph_lock(&graph.id, |rows| {
            rows.conn()
                .execute(
                    "UPDATE graphs SET metadata = '{\"x\":1}' WHERE id = ?1",
                    params![graph.id.as_str()],
                )
                .map_err(db_err)?;
            Err(TrellisError::Validation("abort".into()))
        });
        assert!(result.is_err());
        let found = store.find_graph(&graph.id).unwrap().unwrap();
        assert!(found.metadata.is_empty());
    }

    #[test]
    fn test_try_lock_fails_fast_while_held() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let graph = store.create_graph(Map::new()).unwrap();
        let lock = store.locks.get(&graph.id).unwrap();
        let guard = lock.lock().unwrap();

        let err = store
            .try_with_graph_lock(&graph.id, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, TrellisError::LockBusy(_)));

        drop(guard);
        store.try_with_graph_lock(&graph.id, |_| Ok(())).unwrap();
    }

    #[test]
    fn test_graph_lock_serializes_threads() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let graph = store.create_graph(Map::new()).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let graph_id = graph.id.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    store
                        .with_graph_lock(&graph_id, |_| {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trellis.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_graph(Map::new()).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.graph_ids().unwrap().len(), 1);
    }
}
