//! Memory and path CRUD — the write path and the version chain.
//!
//! A content update always creates a new memory row, deprecates the old one
//! with `migrated_to = new_id`, and repoints every path (aliases stay in
//! sync). Deleting an address removes only the path; the memory becomes
//! deprecated when its last path goes away.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;

use super::{content_hash, Store};
use crate::errors::{PalaceError, Result};

/// A memory row, as stored.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub content: String,
    pub content_hash: String,
    pub deprecated: bool,
    pub migrated_to: Option<i64>,
    pub vitality_score: f64,
    pub access_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub last_accessed_at: Option<String>,
}

/// A path row (address → memory).
#[derive(Debug, Clone, Serialize)]
pub struct PathRecord {
    pub domain: String,
    pub path: String,
    pub memory_id: i64,
    pub priority: i64,
    pub disclosure: Option<String>,
    pub created_at: String,
}

impl PathRecord {
    pub fn uri(&self) -> String {
        format!("{}://{}", self.domain, self.path)
    }
}

/// A memory resolved through a specific address.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMemory {
    pub memory: MemoryRecord,
    pub domain: String,
    pub path: String,
    pub priority: i64,
    pub disclosure: Option<String>,
}

impl ResolvedMemory {
    pub fn uri(&self) -> String {
        format!("{}://{}", self.domain, self.path)
    }
}

/// One direct child in a tree listing.
#[derive(Debug, Clone, Serialize)]
pub struct ChildEntry {
    pub domain: String,
    pub path: String,
    pub memory_id: i64,
    pub priority: i64,
    pub disclosure: Option<String>,
    pub content_snippet: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResult {
    pub id: i64,
    pub domain: String,
    pub path: String,
    pub uri: String,
    pub priority: i64,
    pub index_targets: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResult {
    pub domain: String,
    pub path: String,
    pub uri: String,
    pub old_memory_id: i64,
    pub new_memory_id: i64,
    pub metadata_only: bool,
    pub index_targets: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct RemovePathResult {
    pub removed_uri: String,
    pub memory_id: i64,
    pub surviving_paths: Vec<String>,
    pub deprecated_now: bool,
}

#[derive(Debug, Serialize)]
pub struct AddAliasResult {
    pub new_uri: String,
    pub target_uri: String,
    pub memory_id: i64,
}

/// An orphan listing entry: deprecated versions or path-less memories.
#[derive(Debug, Serialize)]
pub struct OrphanEntry {
    pub memory_id: i64,
    pub category: String,
    pub content_snippet: String,
    pub migrated_to: Option<i64>,
    pub created_at: String,
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        content: row.get(1)?,
        content_hash: row.get(2)?,
        deprecated: row.get::<_, i64>(3)? != 0,
        migrated_to: row.get(4)?,
        vitality_score: row.get(5)?,
        access_count: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        last_accessed_at: row.get(9)?,
    })
}

const MEMORY_COLS: &str = "id, content, content_hash, deprecated, migrated_to, \
                           vitality_score, access_count, created_at, updated_at, last_accessed_at";

pub fn snippet(content: &str, max_chars: usize) -> String {
    let collapsed: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{cut}...")
}

impl Store {
    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get_memory_by_path(&self, domain: &str, path: &str) -> Result<Option<ResolvedMemory>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT m.id, m.content, m.content_hash, m.deprecated, m.migrated_to, \
                        m.vitality_score, m.access_count, m.created_at, m.updated_at, \
                        m.last_accessed_at, p.priority, p.disclosure \
                 FROM memories m JOIN paths p ON p.memory_id = m.id \
                 WHERE p.domain = ?1 AND p.path = ?2",
                params![domain, path],
                |row| {
                    let memory = row_to_memory(row)?;
                    Ok(ResolvedMemory {
                        memory,
                        domain: domain.to_string(),
                        path: path.to_string(),
                        priority: row.get(10)?,
                        disclosure: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_memory_by_id(&self, memory_id: i64) -> Result<Option<MemoryRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {MEMORY_COLS} FROM memories WHERE id = ?1"),
                params![memory_id],
                row_to_memory,
            )
            .optional()?;
        Ok(row)
    }

    pub fn paths_for_memory(&self, memory_id: i64) -> Result<Vec<PathRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT domain, path, memory_id, priority, disclosure, created_at \
             FROM paths WHERE memory_id = ?1 ORDER BY priority ASC, path ASC",
        )?;
        let rows = stmt
            .query_map(params![memory_id], |row| {
                Ok(PathRecord {
                    domain: row.get(0)?,
                    path: row.get(1)?,
                    memory_id: row.get(2)?,
                    priority: row.get(3)?,
                    disclosure: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Direct children across ALL paths (aliases) of a memory. What you see
    /// under a memory depends on what the memory IS, not which path led here.
    pub fn children_of_memory(&self, memory_id: i64) -> Result<Vec<ChildEntry>> {
        let parents = self.paths_for_memory(memory_id)?;
        let conn = self.conn();
        let mut out = Vec::new();
        for parent in &parents {
            let prefix = if parent.path.is_empty() {
                String::new()
            } else {
                format!("{}/", parent.path)
            };
            let like = format!("{}%", escape_like(&prefix));
            let mut stmt = conn.prepare(
                "SELECT p.domain, p.path, p.memory_id, p.priority, p.disclosure, m.content \
                 FROM paths p JOIN memories m ON m.id = p.memory_id \
                 WHERE p.domain = ?1 AND p.path LIKE ?2 ESCAPE '\\' \
                 ORDER BY p.priority ASC, p.path ASC",
            )?;
            let rows = stmt.query_map(params![parent.domain, like], |row| {
                let content: String = row.get(5)?;
                Ok(ChildEntry {
                    domain: row.get(0)?,
                    path: row.get(1)?,
                    memory_id: row.get(2)?,
                    priority: row.get(3)?,
                    disclosure: row.get(4)?,
                    content_snippet: snippet(&content, 120),
                })
            })?;
            for row in rows {
                let child = row?;
                // Direct children only: exactly one extra segment.
                let remainder = &child.path[prefix.len()..];
                if !remainder.is_empty() && !remainder.contains('/') {
                    out.push(child);
                }
            }
        }
        out.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.path.cmp(&b.path))
        });
        out.dedup_by(|a, b| a.domain == b.domain && a.path == b.path);
        Ok(out)
    }

    pub fn list_all_paths(&self, domain: Option<&str>) -> Result<Vec<PathRecord>> {
        let conn = self.conn();
        let mut out = Vec::new();
        match domain {
            Some(domain) => {
                let mut stmt = conn.prepare(
                    "SELECT domain, path, memory_id, priority, disclosure, created_at \
                     FROM paths WHERE domain = ?1 ORDER BY domain, path",
                )?;
                let rows = stmt.query_map(params![domain], path_record_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT domain, path, memory_id, priority, disclosure, created_at \
                     FROM paths ORDER BY domain, path",
                )?;
                let rows = stmt.query_map([], path_record_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Most recently modified non-deprecated memories that still have a path.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<ResolvedMemory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.content, m.content_hash, m.deprecated, m.migrated_to, \
                    m.vitality_score, m.access_count, m.created_at, m.updated_at, m.last_accessed_at, \
                    p.domain, p.path, p.priority, p.disclosure \
             FROM memories m \
             JOIN paths p ON p.memory_id = m.id \
             WHERE m.deprecated = 0 \
             GROUP BY m.id \
             ORDER BY m.updated_at DESC \
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let memory = row_to_memory(row)?;
                Ok(ResolvedMemory {
                    memory,
                    domain: row.get(10)?,
                    path: row.get(11)?,
                    priority: row.get(12)?,
                    disclosure: row.get(13)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deprecated versions and path-less memories, for maintenance review.
    pub fn list_orphans(&self) -> Result<Vec<OrphanEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.content, m.deprecated, m.migrated_to, m.created_at, \
                    (SELECT COUNT(*) FROM paths p WHERE p.memory_id = m.id) AS path_count \
             FROM memories m \
             WHERE m.deprecated = 1 \
                OR NOT EXISTS (SELECT 1 FROM paths p WHERE p.memory_id = m.id) \
             ORDER BY m.id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let content: String = row.get(1)?;
                let deprecated: i64 = row.get(2)?;
                Ok(OrphanEntry {
                    memory_id: row.get(0)?,
                    category: if deprecated != 0 {
                        "deprecated".to_string()
                    } else {
                        "orphaned".to_string()
                    },
                    content_snippet: snippet(&content, 160),
                    migrated_to: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Create a new memory under a parent path. Without a title, the next
    /// numeric token unique under the parent is assigned.
    pub fn create_memory(
        &self,
        domain: &str,
        parent_path: &str,
        content: &str,
        priority: i64,
        title: Option<&str>,
        disclosure: Option<&str>,
        index_now: bool,
    ) -> Result<CreateResult> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if !parent_path.is_empty() {
            let parent_exists: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM paths WHERE domain = ?1 AND path = ?2",
                params![domain, parent_path],
                |row| row.get(0),
            )?;
            if !parent_exists {
                return Err(PalaceError::AddressNotFound(format!(
                    "{domain}://{parent_path} (create the parent first, or use {domain}:// as root)"
                )));
            }
        }

        let final_path = match title {
            Some(title) => {
                if parent_path.is_empty() {
                    title.to_string()
                } else {
                    format!("{parent_path}/{title}")
                }
            }
            None => {
                let next = next_numeric_token(&tx, domain, parent_path)?;
                if parent_path.is_empty() {
                    next.to_string()
                } else {
                    format!("{parent_path}/{next}")
                }
            }
        };

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM paths WHERE domain = ?1 AND path = ?2",
            params![domain, final_path],
            |row| row.get(0),
        )?;
        if exists {
            return Err(PalaceError::InvalidArgument(format!(
                "path '{domain}://{final_path}' already exists"
            )));
        }

        let now = Store::now_iso();
        tx.execute(
            "INSERT INTO memories (content, content_hash, deprecated, vitality_score, \
             access_count, created_at, updated_at) VALUES (?1, ?2, 0, 1.0, 0, ?3, ?3)",
            params![content, content_hash(content), now],
        )?;
        let memory_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO paths (domain, path, memory_id, priority, disclosure, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![domain, final_path, memory_id, priority, disclosure, now],
        )?;

        if index_now {
            super::index::reindex_memory_tx(&tx, memory_id, &self.config, None)?;
        }
        tx.commit()?;

        Ok(CreateResult {
            id: memory_id,
            domain: domain.to_string(),
            path: final_path.clone(),
            uri: format!("{domain}://{final_path}"),
            priority,
            index_targets: vec![memory_id],
        })
    }

    /// Update a memory: content creates a new version (deprecate + repoint);
    /// priority/disclosure touch only the path row.
    pub fn update_memory(
        &self,
        domain: &str,
        path: &str,
        content: Option<&str>,
        priority: Option<i64>,
        disclosure: Option<&str>,
        index_now: bool,
    ) -> Result<UpdateResult> {
        if content.is_none() && priority.is_none() && disclosure.is_none() {
            return Err(PalaceError::InvalidArgument(format!(
                "no update fields provided for '{domain}://{path}'"
            )));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let old_id: Option<i64> = tx
            .query_row(
                "SELECT m.id FROM memories m JOIN paths p ON p.memory_id = m.id \
                 WHERE p.domain = ?1 AND p.path = ?2 AND m.deprecated = 0",
                params![domain, path],
                |row| row.get(0),
            )
            .optional()?;
        let old_id =
            old_id.ok_or_else(|| PalaceError::AddressNotFound(format!("{domain}://{path}")))?;

        if priority.is_some() || disclosure.is_some() {
            tx.execute(
                "UPDATE paths SET \
                 priority = COALESCE(?1, priority), \
                 disclosure = COALESCE(?2, disclosure) \
                 WHERE domain = ?3 AND path = ?4",
                params![priority, disclosure, domain, path],
            )?;
        }

        let now = Store::now_iso();
        let mut new_id = old_id;
        let mut index_targets = Vec::new();

        if let Some(content) = content {
            // Always persist a new version; the caller validated the change.
            tx.execute(
                "INSERT INTO memories (content, content_hash, deprecated, vitality_score, \
                 access_count, created_at, updated_at) VALUES (?1, ?2, 0, 1.0, 0, ?3, ?3)",
                params![content, content_hash(content), now],
            )?;
            new_id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE memories SET deprecated = 1, migrated_to = ?1, updated_at = ?2 WHERE id = ?3",
                params![new_id, now, old_id],
            )?;
            // Repoint every path (aliases follow the content update).
            tx.execute(
                "UPDATE paths SET memory_id = ?1 WHERE memory_id = ?2",
                params![new_id, old_id],
            )?;

            super::index::clear_memory_index_tx(&tx, old_id)?;
            index_targets.push(new_id);
            if index_now {
                super::index::reindex_memory_tx(&tx, new_id, &self.config, None)?;
            }
        }

        tx.commit()?;

        Ok(UpdateResult {
            domain: domain.to_string(),
            path: path.to_string(),
            uri: format!("{domain}://{path}"),
            old_memory_id: old_id,
            new_memory_id: new_id,
            metadata_only: content.is_none(),
            index_targets,
        })
    }

    /// Remove a path. The memory survives under its other paths; when the
    /// last path goes away it becomes deprecated (review can still reach it).
    pub fn remove_path(&self, domain: &str, path: &str) -> Result<RemovePathResult> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let memory_id: Option<i64> = tx
            .query_row(
                "SELECT memory_id FROM paths WHERE domain = ?1 AND path = ?2",
                params![domain, path],
                |row| row.get(0),
            )
            .optional()?;
        let memory_id =
            memory_id.ok_or_else(|| PalaceError::AddressNotFound(format!("{domain}://{path}")))?;

        // Refuse to strand children; the caller must delete them first.
        let child_like = format!("{}/%", escape_like(path));
        let child_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM paths WHERE domain = ?1 AND path LIKE ?2 ESCAPE '\\'",
            params![domain, child_like],
            |row| row.get(0),
        )?;
        if child_count > 0 {
            return Err(PalaceError::InvalidArgument(format!(
                "cannot delete '{domain}://{path}': it still has {child_count} child path(s)"
            )));
        }

        tx.execute(
            "DELETE FROM paths WHERE domain = ?1 AND path = ?2",
            params![domain, path],
        )?;

        let mut surviving = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT domain, path FROM paths WHERE memory_id = ?1 ORDER BY domain, path",
            )?;
            let rows = stmt.query_map(params![memory_id], |row| {
                let domain: String = row.get(0)?;
                let path: String = row.get(1)?;
                Ok(format!("{domain}://{path}"))
            })?;
            for row in rows {
                surviving.push(row?);
            }
        }

        let deprecated_now = surviving.is_empty();
        if deprecated_now {
            tx.execute(
                "UPDATE memories SET deprecated = 1, updated_at = ?1 WHERE id = ?2",
                params![Store::now_iso(), memory_id],
            )?;
            super::index::clear_memory_index_tx(&tx, memory_id)?;
        }

        tx.commit()?;

        Ok(RemovePathResult {
            removed_uri: format!("{domain}://{path}"),
            memory_id,
            surviving_paths: surviving,
            deprecated_now,
        })
    }

    /// Create an alias path pointing at the same memory as the target.
    pub fn add_path(
        &self,
        new_domain: &str,
        new_path: &str,
        target_domain: &str,
        target_path: &str,
        priority: i64,
        disclosure: Option<&str>,
    ) -> Result<AddAliasResult> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let target_id: Option<i64> = tx
            .query_row(
                "SELECT memory_id FROM paths WHERE domain = ?1 AND path = ?2",
                params![target_domain, target_path],
                |row| row.get(0),
            )
            .optional()?;
        let target_id = target_id.ok_or_else(|| {
            PalaceError::AddressNotFound(format!("{target_domain}://{target_path}"))
        })?;

        if let Some((parent, _)) = new_path.rsplit_once('/') {
            let parent_exists: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM paths WHERE domain = ?1 AND path = ?2",
                params![new_domain, parent],
                |row| row.get(0),
            )?;
            if !parent_exists {
                return Err(PalaceError::AddressNotFound(format!(
                    "{new_domain}://{parent} (create the parent first)"
                )));
            }
        }

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM paths WHERE domain = ?1 AND path = ?2",
            params![new_domain, new_path],
            |row| row.get(0),
        )?;
        if exists {
            return Err(PalaceError::InvalidArgument(format!(
                "path '{new_domain}://{new_path}' already exists"
            )));
        }

        tx.execute(
            "INSERT INTO paths (domain, path, memory_id, priority, disclosure, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_domain,
                new_path,
                target_id,
                priority,
                disclosure,
                Store::now_iso()
            ],
        )?;
        tx.commit()?;

        Ok(AddAliasResult {
            new_uri: format!("{new_domain}://{new_path}"),
            target_uri: format!("{target_domain}://{target_path}"),
            memory_id: target_id,
        })
    }

    /// Restore a path to a specific memory (rollback of a delete). The target
    /// memory is un-deprecated so it becomes reachable again.
    pub fn restore_path(
        &self,
        domain: &str,
        path: &str,
        memory_id: i64,
        priority: i64,
        disclosure: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
            params![memory_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(PalaceError::AddressNotFound(format!("memory {memory_id}")));
        }
        tx.execute(
            "UPDATE memories SET deprecated = 0 WHERE id = ?1",
            params![memory_id],
        )?;

        let collision: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM paths WHERE domain = ?1 AND path = ?2",
            params![domain, path],
            |row| row.get(0),
        )?;
        if collision {
            return Err(PalaceError::InvalidArgument(format!(
                "path '{domain}://{path}' already exists"
            )));
        }

        tx.execute(
            "INSERT INTO paths (domain, path, memory_id, priority, disclosure, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![domain, path, memory_id, priority, disclosure, Store::now_iso()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Roll a path back to a prior memory version: the current version is
    /// deprecated (pointing forward at the restored one) and all paths
    /// repoint to the restored version, which is reactivated.
    pub fn rollback_to_memory(
        &self,
        domain: &str,
        path: &str,
        target_memory_id: i64,
        index_now: bool,
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current_id: Option<i64> = tx
            .query_row(
                "SELECT memory_id FROM paths WHERE domain = ?1 AND path = ?2",
                params![domain, path],
                |row| row.get(0),
            )
            .optional()?;
        let current_id =
            current_id.ok_or_else(|| PalaceError::AddressNotFound(format!("{domain}://{path}")))?;

        let target_exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
            params![target_memory_id],
            |row| row.get(0),
        )?;
        if !target_exists {
            return Err(PalaceError::AddressNotFound(format!(
                "memory {target_memory_id}"
            )));
        }

        let now = Store::now_iso();
        tx.execute(
            "UPDATE memories SET deprecated = 1, migrated_to = ?1, updated_at = ?2 WHERE id = ?3",
            params![target_memory_id, now, current_id],
        )?;
        tx.execute(
            "UPDATE memories SET deprecated = 0, migrated_to = NULL, updated_at = ?1 WHERE id = ?2",
            params![now, target_memory_id],
        )?;
        tx.execute(
            "UPDATE paths SET memory_id = ?1 WHERE memory_id = ?2",
            params![target_memory_id, current_id],
        )?;

        super::index::clear_memory_index_tx(&tx, current_id)?;
        if index_now {
            super::index::reindex_memory_tx(&tx, target_memory_id, &self.config, None)?;
        }
        tx.commit()?;
        Ok(vec![target_memory_id])
    }

    /// Permanently delete an orphan memory, repairing the version chain
    /// (A→B→C, delete B ⇒ A→C). With `expected_state_hash`, the deletion is
    /// guarded against concurrent mutation (`stale_state`).
    pub fn permanently_delete_memory(
        &self,
        memory_id: i64,
        require_orphan: bool,
        expected_state_hash: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let row: Option<(String, i64, i64, f64, i64)> = tx
            .query_row(
                "SELECT m.content, m.deprecated, m.access_count, m.vitality_score, \
                        (SELECT COUNT(*) FROM paths p WHERE p.memory_id = m.id) \
                 FROM memories m WHERE m.id = ?1",
                params![memory_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        let (_, deprecated, access_count, vitality, path_count) =
            row.ok_or_else(|| PalaceError::AddressNotFound(format!("memory {memory_id}")))?;

        if require_orphan && path_count > 0 && deprecated == 0 {
            return Err(PalaceError::InvalidArgument(format!(
                "memory {memory_id} still has {path_count} active path(s)"
            )));
        }

        if let Some(expected) = expected_state_hash {
            let current = crate::vitality::state_hash(
                memory_id,
                vitality,
                access_count,
                path_count,
                deprecated != 0,
            );
            if current != expected {
                return Err(PalaceError::StaleState(memory_id));
            }
        }

        // Repair the version chain around the deleted node.
        let migrated_to: Option<i64> = tx.query_row(
            "SELECT migrated_to FROM memories WHERE id = ?1",
            params![memory_id],
            |r| r.get(0),
        )?;
        tx.execute(
            "UPDATE memories SET migrated_to = ?1 WHERE migrated_to = ?2",
            params![migrated_to, memory_id],
        )?;

        super::index::clear_memory_index_tx(&tx, memory_id)?;
        tx.execute(
            "DELETE FROM memory_gists WHERE memory_id = ?1",
            params![memory_id],
        )?;
        tx.execute(
            "DELETE FROM memory_tags WHERE memory_id = ?1",
            params![memory_id],
        )?;
        tx.execute("DELETE FROM paths WHERE memory_id = ?1", params![memory_id])?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![memory_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Set path metadata exactly (including clearing disclosure). Used by
    /// snapshot rollback, which must restore the pre-state byte-for-byte.
    pub fn set_path_meta(
        &self,
        domain: &str,
        path: &str,
        priority: i64,
        disclosure: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE paths SET priority = ?1, disclosure = ?2 WHERE domain = ?3 AND path = ?4",
            params![priority, disclosure, domain, path],
        )?;
        if changed == 0 {
            return Err(PalaceError::AddressNotFound(format!("{domain}://{path}")));
        }
        Ok(())
    }

    // ── runtime_meta ─────────────────────────────────────────────────────────

    pub fn get_runtime_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM runtime_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_runtime_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runtime_meta (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Store::now_iso()],
        )?;
        Ok(())
    }
}

fn path_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PathRecord> {
    Ok(PathRecord {
        domain: row.get(0)?,
        path: row.get(1)?,
        memory_id: row.get(2)?,
        priority: row.get(3)?,
        disclosure: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Next numeric token unique among direct children of `parent_path`.
fn next_numeric_token(tx: &Transaction<'_>, domain: &str, parent_path: &str) -> Result<i64> {
    let prefix = if parent_path.is_empty() {
        String::new()
    } else {
        format!("{}/", parent_path)
    };
    let like = if prefix.is_empty() {
        "%".to_string()
    } else {
        format!("{}%", escape_like(&prefix))
    };

    let mut max_num = 0i64;
    let mut stmt =
        tx.prepare("SELECT path FROM paths WHERE domain = ?1 AND path LIKE ?2 ESCAPE '\\'")?;
    let rows = stmt.query_map(params![domain, like], |row| row.get::<_, String>(0))?;
    for row in rows {
        let path = row?;
        let remainder = &path[prefix.len().min(path.len())..];
        if !remainder.contains('/') {
            if let Ok(num) = remainder.parse::<i64>() {
                max_num = max_num.max(num);
            }
        }
    }
    Ok(max_num + 1)
}

pub(crate) fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
