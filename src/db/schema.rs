/// Schema for the task queue and the shell cache generations.
pub const SCHEMA: &str = r#"
-- Pending follow-up work. `body` holds the producer's JSON in the shape
-- named by `schema_version`; readers normalize both shapes.
CREATE TABLE IF NOT EXISTS task_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schema_version INTEGER NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_queue_created
    ON task_queue(created_at, id);

-- Stored request/response pairs, one logical cache per `cache_name`
-- (e.g. "shell-v51", "runtime-v51").
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    url_without_query TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_search
    ON cache_entries(cache_name, url_without_query);

-- Small key/value table for shell lifecycle bookkeeping.
CREATE TABLE IF NOT EXISTS shell_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
