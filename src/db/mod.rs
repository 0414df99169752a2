pub mod migrations;
pub mod schema;

use anyhow::Context;
use fs2::FileExt;
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::errors::{PalaceError, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Options controlling database initialization.
pub struct OpenOptions<'a> {
    pub embedding_dim: usize,
    pub embedding_model: &'a str,
    pub migration_lock_file: &'a Path,
    pub migration_lock_timeout: Duration,
}

/// Open (or create) the store at the given path with all extensions loaded,
/// schema initialized, and pending migrations applied under the file lock.
pub fn open_database(path: impl AsRef<Path>, opts: &OpenOptions<'_>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path).with_context(|| {
        format!(
            "failed to open database at {}. If the file is corrupt, restore from a backup.",
            path.display()
        )
    })?;

    // WAL for concurrent readers, FK enforcement, and a lock grace period.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn, opts.embedding_dim).context("failed to initialize schema")?;

    // Exactly one process may run migrations; a timeout aborts startup rather
    // than risking concurrent schema changes.
    {
        let _lock = acquire_migration_lock(opts.migration_lock_file, opts.migration_lock_timeout)?;
        migrations::run_migrations(&mut conn)?;
    }

    record_embedding_meta(&conn, opts.embedding_model, opts.embedding_dim)?;

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        return Err(anyhow::anyhow!("database integrity check failed: {integrity}").into());
    }

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

#[derive(Debug)]
struct MigrationLock {
    file: std::fs::File,
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn acquire_migration_lock(lock_path: &Path, timeout: Duration) -> Result<MigrationLock> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("failed to open migration lock {}", lock_path.display()))?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(MigrationLock { file }),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(_) => {
                return Err(PalaceError::MigrationLockTimeout(
                    lock_path.display().to_string(),
                ))
            }
        }
    }
}

/// Record the embedding model/dim in runtime_meta; warn when the configured
/// model differs from what the existing vectors were built with.
fn record_embedding_meta(conn: &Connection, model: &str, dim: usize) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM runtime_meta WHERE key = 'embedding.model'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(stored) = &stored {
        if stored != model {
            tracing::warn!(
                stored = %stored,
                configured = %model,
                "embedding model changed — run a full rebuild_index to refresh vectors"
            );
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO runtime_meta (key, value, updated_at) VALUES ('embedding.model', ?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![model, now],
    )?;
    conn.execute(
        "INSERT INTO runtime_meta (key, value, updated_at) VALUES ('embedding.dim', ?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![dim.to_string(), now],
    )?;
    Ok(())
}

/// Open an in-memory database for testing.
pub fn open_memory_database(embedding_dim: usize) -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, embedding_dim).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn)?;
    Ok(conn)
}
