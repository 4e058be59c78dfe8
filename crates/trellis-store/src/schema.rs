/// Tables for graphs and their graph-scoped children. Every child row
/// cascades from its graph, so destroying a graph purges everything.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS graphs (
    id TEXT PRIMARY KEY,
    lock_key INTEGER NOT NULL,
    lock_version INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lanes (
    id TEXT PRIMARY KEY,
    graph_id TEXT NOT NULL REFERENCES graphs(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    name TEXT,
    parent_lane_id TEXT,
    forked_from_node_id TEXT,
    root_node_id TEXT,
    merged_into_lane_id TEXT,
    archived_at TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_lanes_one_main
    ON lanes(graph_id) WHERE role = 'main';

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    graph_id TEXT NOT NULL REFERENCES graphs(id) ON DELETE CASCADE,
    lane_id TEXT NOT NULL REFERENCES lanes(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    anchor_node_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(lane_id, seq)
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    graph_id TEXT NOT NULL REFERENCES graphs(id) ON DELETE CASCADE,
    node_type TEXT NOT NULL,
    state TEXT NOT NULL,
    body_kind TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    lane_id TEXT,
    turn_id TEXT,
    idempotency_key TEXT,
    retry_of_id TEXT,
    error TEXT,
    compressed_at TEXT,
    compressed_by_id TEXT,
    context_excluded_at TEXT,
    deleted_at TEXT,
    claimed_at TEXT,
    claimed_by TEXT,
    lease_expires_at TEXT,
    heartbeat_at TEXT,
    started_at TEXT,
    finished_at TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_idempotency
    ON nodes(graph_id, IFNULL(turn_id, ''), node_type, idempotency_key)
    WHERE idempotency_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_nodes_graph_state ON nodes(graph_id, state);
CREATE INDEX IF NOT EXISTS idx_nodes_turn ON nodes(turn_id);
CREATE INDEX IF NOT EXISTS idx_nodes_lease ON nodes(state, lease_expires_at);

CREATE TABLE IF NOT EXISTS node_bodies (
    node_id TEXT PRIMARY KEY REFERENCES nodes(id) ON DELETE CASCADE,
    input TEXT NOT NULL DEFAULT '{}',
    output TEXT NOT NULL DEFAULT '{}',
    output_preview TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    graph_id TEXT NOT NULL REFERENCES graphs(id) ON DELETE CASCADE,
    from_node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    to_node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    edge_type TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    compressed_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(from_node_id, to_node_id, edge_type)
);

CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_node_id);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_node_id);

CREATE TABLE IF NOT EXISTS visibility_patches (
    node_id TEXT PRIMARY KEY REFERENCES nodes(id) ON DELETE CASCADE,
    graph_id TEXT NOT NULL REFERENCES graphs(id) ON DELETE CASCADE,
    context_excluded INTEGER,
    deleted INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS node_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    graph_id TEXT NOT NULL REFERENCES graphs(id) ON DELETE CASCADE,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    payload TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_node_events_node ON node_events(node_id, id);
";
