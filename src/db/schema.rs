/// Schema for all durable tables.
pub const SCHEMA: &str = r#"
-- Small key/value table (active cache generation, id counter, permissions)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Named cache stores (one row per generation)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses keyed by request identity hash
CREATE TABLE IF NOT EXISTS cache_entries (
    store TEXT NOT NULL,
    request_key TEXT NOT NULL,
    request_identity TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, request_key)
);

-- Pending operations; seq is the replay order
CREATE TABLE IF NOT EXISTS pending_operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id INTEGER NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    target_entity TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_status
    ON pending_operations(status, seq);
"#;
