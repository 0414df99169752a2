//! Forward-only schema migration framework.
//!
//! Each migration is a numbered SQL script compiled into the binary. Applied
//! versions are tracked in `schema_migrations` with a sha256 checksum; a
//! checksum mismatch for an already-applied version is fatal (someone edited
//! history). Concurrent processes are excluded by a file lock taken in
//! [`crate::db::open_database`].

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::errors::{PalaceError, Result};

/// Compiled-in migrations, applied in order. Never reorder or edit an entry
/// that has shipped; append a new version instead.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001",
        "ALTER TABLE memories ADD COLUMN migrated_to INTEGER;",
    ),
    (
        "0002",
        "CREATE INDEX IF NOT EXISTS idx_memories_cleanup \
         ON memories(deprecated, vitality_score, last_accessed_at);",
    ),
    (
        "0003",
        "CREATE INDEX IF NOT EXISTS idx_paths_memory ON paths(memory_id, domain, path);",
    ),
];

fn checksum(sql: &str) -> String {
    // Normalize line endings so CRLF/LF checkout differences do not break boot.
    let normalized = sql.replace("\r\n", "\n").replace('\r', "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Run any pending migrations. Each migration runs in its own transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    for (version, sql) in MIGRATIONS {
        let current = checksum(sql);
        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(recorded) = recorded {
            if recorded != current {
                return Err(PalaceError::MigrationChecksumMismatch {
                    version: version.to_string(),
                    recorded,
                    current,
                });
            }
            continue;
        }

        tracing::info!(version, "applying migration");
        let tx = conn.transaction()?;
        if let Err(e) = tx.execute_batch(sql) {
            // Columns added by older builds surface as duplicate-column errors
            // when the base schema already includes them.
            if !is_ignorable_add_column_error(sql, &e) {
                return Err(e.into());
            }
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339(), current],
        )?;
        tx.commit()?;
    }
    Ok(())
}

fn is_ignorable_add_column_error(sql: &str, err: &rusqlite::Error) -> bool {
    let is_add_column = sql.trim_start().to_ascii_uppercase().starts_with("ALTER TABLE")
        && sql.to_ascii_uppercase().contains("ADD COLUMN");
    is_add_column && err.to_string().to_ascii_lowercase().contains("duplicate column name")
}

/// Highest applied migration version, if any.
pub fn applied_version(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT MAX(version) FROM schema_migrations",
        [],
        |row| row.get::<_, Option<String>>(0),
    )
}
