//! SQL DDL for all store tables.
//!
//! Defines `memories`, `paths`, `memory_chunks`, `chunks_fts` (FTS5),
//! `chunks_vec` (vec0), `memory_gists`, `memory_tags`, `snapshots`,
//! `index_jobs`, `cleanup_reviews`, `runtime_meta`, and `schema_migrations`.
//! All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the relational tables.
const SCHEMA_SQL: &str = r#"
-- Memory records. Content updates create a NEW row and deprecate the old one,
-- linking it forward via migrated_to (version chain).
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    deprecated INTEGER NOT NULL DEFAULT 0,
    migrated_to INTEGER,
    vitality_score REAL NOT NULL DEFAULT 1.0,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_deprecated ON memories(deprecated);
CREATE INDEX IF NOT EXISTS idx_memories_cleanup ON memories(deprecated, vitality_score, last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_memories_migrated ON memories(migrated_to);

-- Addresses. Many paths may point at one memory (aliases).
CREATE TABLE IF NOT EXISTS paths (
    domain TEXT NOT NULL,
    path TEXT NOT NULL,
    memory_id INTEGER NOT NULL REFERENCES memories(id),
    priority INTEGER NOT NULL DEFAULT 0,
    disclosure TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (domain, path)
);

CREATE INDEX IF NOT EXISTS idx_paths_memory ON paths(memory_id, domain, path);

-- Chunked slices feeding the full-text and vector side-indices.
CREATE TABLE IF NOT EXISTS memory_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id INTEGER NOT NULL REFERENCES memories(id),
    chunk_index INTEGER NOT NULL,
    chunk_text TEXT NOT NULL,
    char_start INTEGER NOT NULL DEFAULT 0,
    char_end INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_chunks_memory ON memory_chunks(memory_id);

-- Full-text search over chunks. rowid mirrors memory_chunks.id.
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    chunk_text,
    memory_id UNINDEXED
);

-- Compact gists materialized from memory bodies, keyed by source hash.
CREATE TABLE IF NOT EXISTS memory_gists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id INTEGER NOT NULL REFERENCES memories(id),
    gist_text TEXT NOT NULL,
    source_content_hash TEXT NOT NULL,
    gist_method TEXT NOT NULL DEFAULT 'fallback',
    quality_score REAL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_gists_memory_source
    ON memory_gists(memory_id, source_content_hash);

-- Structured tag extraction output.
CREATE TABLE IF NOT EXISTS memory_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id INTEGER NOT NULL REFERENCES memories(id),
    tag_type TEXT NOT NULL,
    tag_value TEXT NOT NULL,
    confidence REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tags_value ON memory_tags(tag_value);

-- Per-session pre-mutation snapshots for diff/rollback review.
CREATE TABLE IF NOT EXISTS snapshots (
    session_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_type TEXT NOT NULL CHECK(resource_type IN ('memory','path')),
    operation_type TEXT NOT NULL
        CHECK(operation_type IN ('create','modify_content','modify_meta','delete','create_alias')),
    snapshot_time TEXT NOT NULL,
    pre_state TEXT NOT NULL,
    PRIMARY KEY (session_id, resource_id)
);

-- Mirror of index worker job records (authoritative state lives in-process).
CREATE TABLE IF NOT EXISTS index_jobs (
    job_id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL CHECK(task_type IN ('rebuild_index','reindex_memory','sleep_consolidation')),
    memory_id INTEGER,
    reason TEXT NOT NULL,
    state TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    error TEXT,
    degrade_reasons TEXT
);

-- Pending two-phase cleanup reviews.
CREATE TABLE IF NOT EXISTS cleanup_reviews (
    review_id TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    confirmation_phrase TEXT NOT NULL,
    action TEXT NOT NULL CHECK(action IN ('delete','keep')),
    reviewer TEXT NOT NULL,
    selections TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Key/value runtime metadata (decay day key, index stats, embedding model).
CREATE TABLE IF NOT EXISTS runtime_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Applied schema migration records.
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL,
    checksum TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax), and its
/// dimension is fixed at creation time from the configured embedding dim.
pub fn vec_table_sql(dim: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(\n\
         \x20   chunk_id INTEGER PRIMARY KEY,\n\
         \x20   embedding FLOAT[{dim}]\n\
         );"
    )
}

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection, embedding_dim: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&vec_table_sql(embedding_dim))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 64).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "memories",
            "paths",
            "memory_chunks",
            "memory_gists",
            "memory_tags",
            "snapshots",
            "index_jobs",
            "cleanup_reviews",
            "runtime_meta",
            "schema_migrations",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        // Virtual tables respond to version queries
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 64).unwrap();
        init_schema(&conn, 64).unwrap();
    }
}
