//! Snapshot Ledger — per-session pre-mutation records for diff and rollback.
//!
//! Snapshots split into two dimensions matching the two store tables:
//!
//! 1. PATH snapshots (`resource_id` = URI): create, create_alias, delete,
//!    modify_meta.
//! 2. MEMORY CONTENT snapshots (`resource_id` = `memory:{id}`): modify_content.
//!
//! The split keeps path-level operations (add_alias) from colliding with
//! content-level operations (update) on the same URI. Within a session the
//! FIRST capture for a key wins; updating a memory repeatedly snapshots only
//! the original version. A create followed by a delete in the same session
//! cancels out — both snapshots are removed, since the net effect is nothing.
//!
//! Content snapshots do not copy the content: the old memory row survives in
//! the store (deprecated, `migrated_to` set), so rollback and diff read it
//! back byte-for-byte.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::errors::{PalaceError, Result};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRecord {
    pub session_id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub operation_type: String,
    pub snapshot_time: String,
    pub pre_state: Value,
}

#[derive(Debug, Serialize)]
pub struct SnapshotDiff {
    pub resource_id: String,
    pub operation_type: String,
    pub pre_state: Value,
    pub current_state: Value,
}

#[derive(Debug, Serialize)]
pub struct RollbackOutcome {
    pub resource_id: String,
    pub operation_type: String,
    pub restored_uri: Option<String>,
    pub index_targets: Vec<i64>,
}

pub struct SnapshotLedger {
    store: Arc<Store>,
}

impl SnapshotLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn insert(
        &self,
        session_id: &str,
        resource_id: &str,
        resource_type: &str,
        operation_type: &str,
        pre_state: &Value,
        force: bool,
    ) -> Result<bool> {
        let conn = self.store.conn();
        let sql = if force {
            "INSERT OR REPLACE INTO snapshots \
             (session_id, resource_id, resource_type, operation_type, snapshot_time, pre_state) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        } else {
            "INSERT OR IGNORE INTO snapshots \
             (session_id, resource_id, resource_type, operation_type, snapshot_time, pre_state) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        };
        let inserted = conn.execute(
            sql,
            params![
                session_id,
                resource_id,
                resource_type,
                operation_type,
                Store::now_iso(),
                pre_state.to_string()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn get(&self, session_id: &str, resource_id: &str) -> Result<Option<SnapshotRecord>> {
        let conn = self.store.conn();
        let row = conn
            .query_row(
                "SELECT session_id, resource_id, resource_type, operation_type, \
                        snapshot_time, pre_state \
                 FROM snapshots WHERE session_id = ?1 AND resource_id = ?2",
                params![session_id, resource_id],
                row_to_snapshot,
            )
            .optional()?;
        Ok(row)
    }

    fn remove(&self, session_id: &str, resource_id: &str) -> Result<bool> {
        let conn = self.store.conn();
        let removed = conn.execute(
            "DELETE FROM snapshots WHERE session_id = ?1 AND resource_id = ?2",
            params![session_id, resource_id],
        )?;
        Ok(removed > 0)
    }

    /// Content snapshot for the URI about to be modified. Idempotent per URI
    /// per session: only the FIRST version in the session is snapshotted,
    /// even though each update mints a new memory id.
    pub fn capture_content(&self, session_id: &str, domain: &str, path: &str) -> Result<bool> {
        let Some(resolved) = self.store.get_memory_by_path(domain, path)? else {
            return Ok(false);
        };
        let uri = resolved.uri();
        let resource_id = format!("memory:{}", resolved.memory.id);

        if self.get(session_id, &resource_id)?.is_some() {
            return Ok(false);
        }
        if self.find_content_snapshot_by_uri(session_id, &uri)?.is_some() {
            return Ok(false);
        }

        // Record every path so rollback survives a later alias deletion.
        let all_paths: Vec<Value> = self
            .store
            .paths_for_memory(resolved.memory.id)?
            .iter()
            .map(|p| {
                json!({
                    "domain": p.domain,
                    "path": p.path,
                    "priority": p.priority,
                    "disclosure": p.disclosure,
                })
            })
            .collect();

        let pre_state = json!({
            "operation_type": "modify_content",
            "memory_id": resolved.memory.id,
            "uri": uri,
            "domain": domain,
            "path": path,
            "all_paths": all_paths,
        });
        self.insert(
            session_id,
            &resource_id,
            "memory",
            "modify_content",
            &pre_state,
            false,
        )
    }

    /// Path metadata snapshot (priority/disclosure) before a meta update.
    pub fn capture_meta(&self, session_id: &str, domain: &str, path: &str) -> Result<bool> {
        let Some(resolved) = self.store.get_memory_by_path(domain, path)? else {
            return Ok(false);
        };
        let uri = resolved.uri();
        if self.get(session_id, &uri)?.is_some() {
            return Ok(false);
        }
        let pre_state = json!({
            "operation_type": "modify_meta",
            "domain": domain,
            "path": path,
            "uri": uri,
            "memory_id": resolved.memory.id,
            "priority": resolved.priority,
            "disclosure": resolved.disclosure,
        });
        self.insert(session_id, &uri, "path", "modify_meta", &pre_state, false)
    }

    /// Record that a path was created (rollback = remove the path). Used by
    /// both create (`create`) and add_alias (`create_alias`).
    pub fn capture_create(
        &self,
        session_id: &str,
        uri: &str,
        domain: &str,
        path: &str,
        memory_id: i64,
        operation_type: &str,
        target_uri: Option<&str>,
    ) -> Result<bool> {
        let mut pre_state = json!({
            "operation_type": operation_type,
            "domain": domain,
            "path": path,
            "uri": uri,
            "memory_id": memory_id,
        });
        if let Some(target) = target_uri {
            pre_state["target_uri"] = json!(target);
        }
        self.insert(session_id, uri, "path", operation_type, &pre_state, false)
    }

    /// Record a path deletion.
    ///
    /// When a `create`/`create_alias` snapshot for the same URI exists in the
    /// session, the pair cancels: both the path snapshot and any content
    /// snapshot for the URI are dropped. Otherwise the current state is
    /// captured as a `delete` snapshot (force overwrite), preserving the
    /// original metadata of a `modify_meta` snapshot if one is replaced.
    pub fn capture_delete(&self, session_id: &str, domain: &str, path: &str) -> Result<bool> {
        let uri = format!("{domain}://{path}");

        if let Some(existing) = self.get(session_id, &uri)? {
            if existing.operation_type == "create" || existing.operation_type == "create_alias" {
                if let Some(content_key) = self.find_content_snapshot_by_uri(session_id, &uri)? {
                    self.remove(session_id, &content_key)?;
                }
                self.remove(session_id, &uri)?;
                return Ok(false);
            }
        }

        let Some(resolved) = self.store.get_memory_by_path(domain, path)? else {
            return Ok(false);
        };

        let mut priority = resolved.priority;
        let mut disclosure = resolved.disclosure.clone();
        if let Some(existing) = self.get(session_id, &uri)? {
            if existing.operation_type == "modify_meta" {
                // Keep the pre-session metadata, not the mid-session values.
                if let Some(p) = existing.pre_state.get("priority").and_then(Value::as_i64) {
                    priority = p;
                }
                disclosure = existing
                    .pre_state
                    .get("disclosure")
                    .and_then(Value::as_str)
                    .map(String::from);
            }
        }

        let pre_state = json!({
            "operation_type": "delete",
            "domain": domain,
            "path": path,
            "uri": uri,
            "memory_id": resolved.memory.id,
            "priority": priority,
            "disclosure": disclosure,
        });
        self.insert(session_id, &uri, "path", "delete", &pre_state, true)
    }

    fn find_content_snapshot_by_uri(
        &self,
        session_id: &str,
        uri: &str,
    ) -> Result<Option<String>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT resource_id, pre_state FROM snapshots \
             WHERE session_id = ?1 AND resource_type = 'memory'",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (resource_id, pre_state) in rows {
            if let Ok(value) = serde_json::from_str::<Value>(&pre_state) {
                if value.get("uri").and_then(Value::as_str) == Some(uri) {
                    return Ok(Some(resource_id));
                }
            }
        }
        Ok(None)
    }

    // ── Review operations ────────────────────────────────────────────────────

    /// All pending snapshots for a session, ordered by capture time.
    pub fn list(&self, session_id: &str) -> Result<Vec<SnapshotRecord>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, resource_id, resource_type, operation_type, \
                    snapshot_time, pre_state \
             FROM snapshots WHERE session_id = ?1 ORDER BY snapshot_time ASC, resource_id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], row_to_snapshot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pre-state vs the current store state for one snapshot.
    pub fn diff(&self, session_id: &str, resource_id: &str) -> Result<SnapshotDiff> {
        let snapshot = self.get(session_id, resource_id)?.ok_or_else(|| {
            PalaceError::SnapshotNotFound {
                session: session_id.to_string(),
                resource: resource_id.to_string(),
            }
        })?;

        let current_state = match snapshot.operation_type.as_str() {
            "modify_content" => {
                let pre_id = snapshot
                    .pre_state
                    .get("memory_id")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let pre_content = self
                    .store
                    .get_memory_by_id(pre_id)?
                    .map(|m| m.content)
                    .unwrap_or_default();
                let (domain, path) = snapshot_domain_path(&snapshot.pre_state);
                let current = self.store.get_memory_by_path(&domain, &path)?;
                json!({
                    "pre_content": pre_content,
                    "current_memory_id": current.as_ref().map(|c| c.memory.id),
                    "current_content": current.map(|c| c.memory.content),
                })
            }
            "modify_meta" | "delete" => {
                let (domain, path) = snapshot_domain_path(&snapshot.pre_state);
                let current = self.store.get_memory_by_path(&domain, &path)?;
                json!({
                    "exists": current.is_some(),
                    "priority": current.as_ref().map(|c| c.priority),
                    "disclosure": current.as_ref().and_then(|c| c.disclosure.clone()),
                })
            }
            _ => {
                let (domain, path) = snapshot_domain_path(&snapshot.pre_state);
                let current = self.store.get_memory_by_path(&domain, &path)?;
                json!({ "exists": current.is_some() })
            }
        };

        Ok(SnapshotDiff {
            resource_id: resource_id.to_string(),
            operation_type: snapshot.operation_type,
            pre_state: snapshot.pre_state,
            current_state,
        })
    }

    /// Accept the mutation: drop the snapshot, leave the store untouched.
    pub fn approve(&self, session_id: &str, resource_id: &str) -> Result<()> {
        if !self.remove(session_id, resource_id)? {
            return Err(PalaceError::SnapshotNotFound {
                session: session_id.to_string(),
                resource: resource_id.to_string(),
            });
        }
        Ok(())
    }

    /// Restore the pre-state into the store and drop the snapshot.
    ///
    /// Rollback is itself a write: callers route it through the Write Lane
    /// using the returned record key from [`rollback_lane_key`].
    pub fn rollback(&self, session_id: &str, resource_id: &str) -> Result<RollbackOutcome> {
        let snapshot = self.get(session_id, resource_id)?.ok_or_else(|| {
            PalaceError::SnapshotNotFound {
                session: session_id.to_string(),
                resource: resource_id.to_string(),
            }
        })?;

        let (domain, path) = snapshot_domain_path(&snapshot.pre_state);
        let mut restored_uri = None;
        let mut index_targets = Vec::new();

        match snapshot.operation_type.as_str() {
            "create" | "create_alias" => {
                self.store.remove_path(&domain, &path)?;
            }
            "modify_content" => {
                let target_id = snapshot
                    .pre_state
                    .get("memory_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        PalaceError::InvalidArgument("snapshot missing memory_id".into())
                    })?;
                // The primary path may have been deleted later in the session;
                // fall back to any other recorded path of the memory.
                let candidates = snapshot_paths(&snapshot.pre_state, &domain, &path);
                let mut rolled_back = false;
                for (d, p) in &candidates {
                    if self.store.get_memory_by_path(d, p)?.is_some() {
                        index_targets = self.store.rollback_to_memory(d, p, target_id, true)?;
                        restored_uri = Some(format!("{d}://{p}"));
                        rolled_back = true;
                        break;
                    }
                }
                if !rolled_back {
                    return Err(PalaceError::AddressNotFound(format!("{domain}://{path}")));
                }
            }
            "modify_meta" => {
                let priority = snapshot
                    .pre_state
                    .get("priority")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let disclosure = snapshot
                    .pre_state
                    .get("disclosure")
                    .and_then(Value::as_str)
                    .map(String::from);
                self.store
                    .set_path_meta(&domain, &path, priority, disclosure.as_deref())?;
                restored_uri = Some(format!("{domain}://{path}"));
            }
            "delete" => {
                let memory_id = snapshot
                    .pre_state
                    .get("memory_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        PalaceError::InvalidArgument("snapshot missing memory_id".into())
                    })?;
                let priority = snapshot
                    .pre_state
                    .get("priority")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let disclosure = snapshot
                    .pre_state
                    .get("disclosure")
                    .and_then(Value::as_str)
                    .map(String::from);
                self.store.restore_path(
                    &domain,
                    &path,
                    memory_id,
                    priority,
                    disclosure.as_deref(),
                )?;
                restored_uri = Some(format!("{domain}://{path}"));
                index_targets.push(memory_id);
            }
            other => {
                return Err(PalaceError::InvalidArgument(format!(
                    "unknown snapshot operation '{other}'"
                )));
            }
        }

        self.remove(session_id, resource_id)?;
        Ok(RollbackOutcome {
            resource_id: resource_id.to_string(),
            operation_type: snapshot.operation_type,
            restored_uri,
            index_targets,
        })
    }

    /// Remove all pending snapshots in a session. Returns how many.
    pub fn clear(&self, session_id: &str) -> Result<usize> {
        let conn = self.store.conn();
        let removed = conn.execute(
            "DELETE FROM snapshots WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(removed)
    }

    /// Lane record key for a pending rollback (per-record exclusion).
    pub fn rollback_lane_key(&self, session_id: &str, resource_id: &str) -> Result<String> {
        let snapshot = self.get(session_id, resource_id)?.ok_or_else(|| {
            PalaceError::SnapshotNotFound {
                session: session_id.to_string(),
                resource: resource_id.to_string(),
            }
        })?;
        if let Some(memory_id) = snapshot.pre_state.get("memory_id").and_then(Value::as_i64) {
            return Ok(crate::lane::memory_key(memory_id));
        }
        let (domain, path) = snapshot_domain_path(&snapshot.pre_state);
        Ok(crate::lane::path_key(&domain, &path))
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    let pre_state: String = row.get(5)?;
    Ok(SnapshotRecord {
        session_id: row.get(0)?,
        resource_id: row.get(1)?,
        resource_type: row.get(2)?,
        operation_type: row.get(3)?,
        snapshot_time: row.get(4)?,
        pre_state: serde_json::from_str(&pre_state).unwrap_or(Value::Null),
    })
}

fn snapshot_domain_path(pre_state: &Value) -> (String, String) {
    (
        pre_state
            .get("domain")
            .and_then(Value::as_str)
            .unwrap_or("core")
            .to_string(),
        pre_state
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

/// Primary path first, then any recorded alias paths.
fn snapshot_paths(pre_state: &Value, domain: &str, path: &str) -> Vec<(String, String)> {
    let mut out = vec![(domain.to_string(), path.to_string())];
    if let Some(paths) = pre_state.get("all_paths").and_then(Value::as_array) {
        for entry in paths {
            let d = entry.get("domain").and_then(Value::as_str);
            let p = entry.get("path").and_then(Value::as_str);
            if let (Some(d), Some(p)) = (d, p) {
                if !(d == domain && p == path) {
                    out.push((d.to_string(), p.to_string()));
                }
            }
        }
    }
    out
}
