//! Side-index maintenance: chunking, FTS5 rows, and chunk vectors.
//!
//! Reindexing a memory is idempotent: it clears the memory's chunk rows and
//! rebuilds them from the current content. The FTS rowid mirrors the chunk id
//! so deletions never scan.

use rusqlite::{params, Transaction};
use serde::Serialize;

use super::{embedding_to_bytes, Store};
use crate::config::PalaceConfig;
use crate::errors::{PalaceError, Result};

/// One chunk of memory content with its character range.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ReindexOutcome {
    pub memory_id: i64,
    pub indexed_chunks: usize,
    pub exists: bool,
    pub deprecated: bool,
}

/// Split content into overlapping chunks, preferring whitespace boundaries in
/// the back half of the window.
pub fn chunk_content(content: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size - 1);
    let bytes = content.as_bytes();
    let total = bytes.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < total {
        let mut end = (start + chunk_size).min(total);
        if end < total {
            let window = &content[start..end];
            let split = window
                .rfind('\n')
                .into_iter()
                .chain(window.rfind(' '))
                .max()
                .map(|offset| start + offset);
            if let Some(split) = split {
                if split > start + chunk_size / 2 {
                    end = split;
                }
            }
        }
        // Keep boundaries on char edges so slicing never panics.
        while end < total && !content.is_char_boundary(end) {
            end += 1;
        }
        if end <= start {
            break;
        }

        let text = &content[start..end];
        if !text.trim().is_empty() {
            chunks.push(Chunk {
                index,
                start,
                end,
                text: text.to_string(),
            });
            index += 1;
        }

        if end >= total {
            break;
        }
        let mut next = end.saturating_sub(chunk_overlap).max(start + 1);
        while next < total && !content.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }

    chunks
}

/// Remove every index row for a memory (chunks, FTS, vectors).
pub(crate) fn clear_memory_index_tx(tx: &Transaction<'_>, memory_id: i64) -> Result<()> {
    let mut stmt = tx.prepare("SELECT id FROM memory_chunks WHERE memory_id = ?1")?;
    let chunk_ids: Vec<i64> = stmt
        .query_map(params![memory_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    for chunk_id in &chunk_ids {
        tx.execute("DELETE FROM chunks_fts WHERE rowid = ?1", params![chunk_id])?;
        tx.execute(
            "DELETE FROM chunks_vec WHERE chunk_id = ?1",
            params![chunk_id],
        )?;
    }
    tx.execute(
        "DELETE FROM memory_chunks WHERE memory_id = ?1",
        params![memory_id],
    )?;
    Ok(())
}

/// Rebuild index rows for one memory inside an open transaction.
///
/// `vectors`, when provided, carries one embedding per chunk (same order as
/// [`chunk_content`]); without it, the hash backend embeds inline and remote
/// backends leave vectors to the index worker.
pub(crate) fn reindex_memory_tx(
    tx: &Transaction<'_>,
    memory_id: i64,
    config: &PalaceConfig,
    vectors: Option<&[Vec<f32>]>,
) -> Result<usize> {
    clear_memory_index_tx(tx, memory_id)?;

    let row: Option<(String, i64)> = {
        use rusqlite::OptionalExtension;
        tx.query_row(
            "SELECT content, deprecated FROM memories WHERE id = ?1",
            params![memory_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
    };
    let Some((content, deprecated)) = row else {
        return Ok(0);
    };
    if deprecated != 0 {
        // Deprecated versions stay out of every index.
        return Ok(0);
    }

    let chunks = chunk_content(
        &content,
        config.retrieval.chunk_size,
        config.retrieval.chunk_overlap,
    );
    if let Some(vectors) = vectors {
        if vectors.len() != chunks.len() {
            return Err(PalaceError::InvalidArgument(format!(
                "vector count {} does not match chunk count {}",
                vectors.len(),
                chunks.len()
            )));
        }
    }

    let hash_inline = vectors.is_none() && config.embedding.backend == "hash";
    for (i, chunk) in chunks.iter().enumerate() {
        tx.execute(
            "INSERT INTO memory_chunks (memory_id, chunk_index, chunk_text, char_start, char_end) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                memory_id,
                chunk.index as i64,
                chunk.text,
                chunk.start as i64,
                chunk.end as i64
            ],
        )?;
        let chunk_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO chunks_fts (rowid, chunk_text, memory_id) VALUES (?1, ?2, ?3)",
            params![chunk_id, chunk.text, memory_id],
        )?;

        let vector: Option<Vec<f32>> = if let Some(vectors) = vectors {
            Some(vectors[i].clone())
        } else if hash_inline {
            Some(crate::remote::hash_embedding(
                &chunk.text,
                config.embedding.dim,
            ))
        } else {
            None
        };
        if let Some(vector) = vector {
            tx.execute(
                "INSERT INTO chunks_vec (chunk_id, embedding) VALUES (?1, ?2)",
                params![chunk_id, embedding_to_bytes(&vector)],
            )?;
        }
    }

    Ok(chunks.len())
}

impl Store {
    /// Idempotent per-record index refresh. `vectors` must align with
    /// [`chunk_content`] over the current content when given.
    pub fn reindex_memory(
        &self,
        memory_id: i64,
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<ReindexOutcome> {
        if memory_id <= 0 {
            return Err(PalaceError::InvalidArgument(
                "memory_id must be a positive integer".into(),
            ));
        }
        let existing = self.get_memory_by_id(memory_id)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let indexed_chunks = reindex_memory_tx(&tx, memory_id, &self.config, vectors)?;
        tx.commit()?;
        Ok(ReindexOutcome {
            memory_id,
            indexed_chunks,
            exists: existing.is_some(),
            deprecated: existing.map(|m| m.deprecated).unwrap_or(false),
        })
    }

    /// All non-deprecated memory ids, in id order (rebuild work list).
    pub fn rebuild_targets(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id FROM memories WHERE deprecated = 0 ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn indexed_chunk_count(&self, memory_id: i64) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM memory_chunks WHERE memory_id = ?1",
            params![memory_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
