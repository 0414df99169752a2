//! Keyword and vector retrieval stages over the store's side-indices.
//!
//! The keyword stage queries FTS5 with bm25 scoring and falls back to a LIKE
//! scan when FTS matches nothing (or the query has no indexable tokens). The
//! vector stage runs a KNN over chunk vectors and post-filters. Both return
//! chunk-level candidate rows that the pipeline merges.

use rusqlite::params;
use serde::Serialize;

use crate::errors::Result;
use crate::store::memory::escape_like;
use crate::store::{embedding_to_bytes, l2_to_cosine, Store};

/// Post-merge filters from the caller plus the strategy template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchFilters {
    pub domain: Option<String>,
    pub path_prefix: Option<String>,
    pub max_priority: Option<i64>,
    /// RFC3339 lower bound on the memory's updated_at.
    pub updated_after: Option<String>,
}

/// One chunk-level retrieval candidate.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub memory_id: i64,
    pub chunk_id: Option<i64>,
    pub chunk_text: String,
    pub char_start: i64,
    pub char_end: i64,
    pub domain: String,
    pub path: String,
    pub priority: i64,
    pub disclosure: Option<String>,
    pub updated_at: String,
    pub keyword_score: f64,
    pub semantic_score: f64,
}

fn filter_clause(filters: &SearchFilters) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = vec!["m.deprecated = 0".to_string()];
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(domain) = &filters.domain {
        params.push(Box::new(domain.clone()));
        clauses.push(format!("p.domain = ?{}", params.len() + 1));
    }
    if let Some(prefix) = &filters.path_prefix {
        params.push(Box::new(format!("{}%", escape_like(prefix))));
        clauses.push(format!("p.path LIKE ?{} ESCAPE '\\'", params.len() + 1));
    }
    if let Some(max_priority) = filters.max_priority {
        params.push(Box::new(max_priority));
        clauses.push(format!("p.priority <= ?{}", params.len() + 1));
    }
    if let Some(updated_after) = &filters.updated_after {
        params.push(Box::new(updated_after.clone()));
        clauses.push(format!("m.updated_at >= ?{}", params.len() + 1));
    }

    (clauses.join(" AND "), params)
}

/// Token-hit ratio for the LIKE fallback, with a small path bonus.
fn like_text_score(query: &str, chunk_text: &str, path: &str) -> f64 {
    let tokens = crate::retrieval::preprocess::tokenize(query);
    if tokens.is_empty() {
        return 0.0;
    }
    let haystack = chunk_text.to_lowercase();
    let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
    let mut score = hits as f64 / tokens.len() as f64 * 0.9;
    if path.to_lowercase().contains(&query.to_lowercase()) {
        score += 0.1;
    }
    score.min(1.0)
}

impl Store {
    /// BM25-scored FTS retrieval, LIKE fallback when FTS yields nothing.
    pub fn keyword_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<CandidateRow>> {
        let tokens = crate::retrieval::preprocess::tokenize(query);
        let mut rows = Vec::new();

        if !tokens.is_empty() {
            let fts_query = tokens
                .iter()
                .take(16)
                .map(|t| format!("\"{}\"", t.replace('"', "")))
                .collect::<Vec<_>>()
                .join(" OR ");
            rows = self.keyword_fts_rows(&fts_query, filters, limit)?;
        }
        if rows.is_empty() {
            rows = self.keyword_like_rows(query, filters, limit)?;
        }
        Ok(rows)
    }

    fn keyword_fts_rows(
        &self,
        fts_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<CandidateRow>> {
        let (where_clause, extra) = filter_clause(filters);
        let sql = format!(
            "SELECT mc.id, mc.memory_id, mc.chunk_text, mc.char_start, mc.char_end, \
                    p.domain, p.path, p.priority, p.disclosure, m.updated_at, \
                    bm25(chunks_fts) AS text_rank \
             FROM chunks_fts \
             JOIN memory_chunks mc ON mc.id = chunks_fts.rowid \
             JOIN memories m ON m.id = mc.memory_id \
             JOIN paths p ON p.memory_id = mc.memory_id \
             WHERE {where_clause} AND chunks_fts MATCH ?1 \
             ORDER BY text_rank ASC LIMIT {limit}"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&fts_query];
        for value in extra.iter() {
            bound.push(value.as_ref());
        }
        let collected = stmt
            .query_map(bound.as_slice(), |row| {
                let rank: f64 = row.get(10)?;
                Ok(CandidateRow {
                    chunk_id: Some(row.get(0)?),
                    memory_id: row.get(1)?,
                    chunk_text: row.get(2)?,
                    char_start: row.get(3)?,
                    char_end: row.get(4)?,
                    domain: row.get(5)?,
                    path: row.get(6)?,
                    priority: row.get(7)?,
                    disclosure: row.get(8)?,
                    updated_at: row.get(9)?,
                    keyword_score: 1.0 / (1.0 + rank.max(0.0)),
                    semantic_score: 0.0,
                })
            })
            .and_then(|mapped| mapped.collect::<std::result::Result<Vec<_>, _>>());
        // An FTS syntax error from exotic input falls back to the LIKE path.
        match collected {
            Ok(rows) => Ok(rows),
            Err(e) => {
                tracing::debug!(error = %e, "FTS query failed, using LIKE fallback");
                Ok(Vec::new())
            }
        }
    }

    fn keyword_like_rows(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<CandidateRow>> {
        let (where_clause, extra) = filter_clause(filters);
        let sql = format!(
            "SELECT mc.id, mc.memory_id, mc.chunk_text, mc.char_start, mc.char_end, \
                    p.domain, p.path, p.priority, p.disclosure, m.updated_at \
             FROM memory_chunks mc \
             JOIN memories m ON m.id = mc.memory_id \
             JOIN paths p ON p.memory_id = mc.memory_id \
             WHERE {where_clause} AND (LOWER(mc.chunk_text) LIKE ?1 OR LOWER(p.path) LIKE ?1) \
             ORDER BY p.priority ASC, m.updated_at DESC LIMIT {limit}"
        );
        let pattern = format!("%{}%", query.to_lowercase());

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&pattern];
        for value in extra.iter() {
            bound.push(value.as_ref());
        }
        let query_owned = query.to_string();
        let rows = stmt
            .query_map(bound.as_slice(), |row| {
                let chunk_text: String = row.get(2)?;
                let path: String = row.get(6)?;
                let score = like_text_score(&query_owned, &chunk_text, &path);
                Ok(CandidateRow {
                    chunk_id: Some(row.get(0)?),
                    memory_id: row.get(1)?,
                    chunk_text,
                    char_start: row.get(3)?,
                    char_end: row.get(4)?,
                    domain: row.get(5)?,
                    path,
                    priority: row.get(7)?,
                    disclosure: row.get(8)?,
                    updated_at: row.get(9)?,
                    keyword_score: score,
                    semantic_score: 0.0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// KNN over chunk vectors, hydrated and post-filtered. Cosine comes from
    /// the L2 distance of normalized vectors.
    pub fn vector_search(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<CandidateRow>> {
        let knn_pool = (limit * 8).clamp(64, 3000);
        let knn: Vec<(i64, f64)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT chunk_id, distance FROM chunks_vec \
                 WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![embedding_to_bytes(embedding), knn_pool as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let (where_clause, extra) = filter_clause(filters);
        let sql = format!(
            "SELECT mc.id, mc.memory_id, mc.chunk_text, mc.char_start, mc.char_end, \
                    p.domain, p.path, p.priority, p.disclosure, m.updated_at \
             FROM memory_chunks mc \
             JOIN memories m ON m.id = mc.memory_id \
             JOIN paths p ON p.memory_id = mc.memory_id \
             WHERE {where_clause} AND mc.id = ?1"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::new();
        for (chunk_id, distance) in knn {
            let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&chunk_id];
            for value in extra.iter() {
                bound.push(value.as_ref());
            }
            let row = stmt
                .query_map(bound.as_slice(), |row| {
                    Ok(CandidateRow {
                        chunk_id: Some(row.get(0)?),
                        memory_id: row.get(1)?,
                        chunk_text: row.get(2)?,
                        char_start: row.get(3)?,
                        char_end: row.get(4)?,
                        domain: row.get(5)?,
                        path: row.get(6)?,
                        priority: row.get(7)?,
                        disclosure: row.get(8)?,
                        updated_at: row.get(9)?,
                        keyword_score: 0.0,
                        semantic_score: l2_to_cosine(distance).clamp(-1.0, 1.0),
                    })
                })?
                .next();
            if let Some(row) = row {
                out.push(row?);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// Contextual snippet around the first query hit.
pub fn make_snippet(text: &str, query: &str, around: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let lowered = text.to_lowercase();
    let needle = query.to_lowercase();
    let Some(pos) = (!needle.is_empty())
        .then(|| lowered.find(&needle))
        .flatten()
    else {
        return crate::store::memory::snippet(text, 120);
    };

    let mut start = pos.saturating_sub(around);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (pos + needle.len() + around).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    let mut snippet = text[start..end].to_string();
    if start > 0 {
        snippet = format!("...{snippet}");
    }
    if end < text.len() {
        snippet = format!("{snippet}...");
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PalaceConfig;
    use crate::remote::hash_embedding;
    use std::sync::Arc;

    fn test_store() -> Store {
        let config = Arc::new(PalaceConfig::default());
        let conn = crate::db::open_memory_database(config.embedding.dim).unwrap();
        Store::new(conn, config)
    }

    fn seed(store: &Store) {
        store
            .create_memory(
                "core",
                "",
                "The quantum computer operates at very low temperatures",
                0,
                Some("quantum"),
                None,
                true,
            )
            .unwrap();
        store
            .create_memory(
                "writer",
                "",
                "Rust is a systems programming language with ownership",
                2,
                Some("rust"),
                None,
                true,
            )
            .unwrap();
    }

    #[test]
    fn keyword_search_matches_fts() {
        let store = test_store();
        seed(&store);
        let rows = store
            .keyword_search("quantum computer", &SearchFilters::default(), 20)
            .unwrap();
        assert!(!rows.is_empty());
        assert_eq!(rows[0].path, "quantum");
        assert!(rows[0].keyword_score > 0.0);
    }

    #[test]
    fn domain_filter_scopes_results() {
        let store = test_store();
        seed(&store);
        let filters = SearchFilters {
            domain: Some("writer".into()),
            ..Default::default()
        };
        let rows = store.keyword_search("rust quantum", &filters, 20).unwrap();
        assert!(rows.iter().all(|r| r.domain == "writer"));
    }

    #[test]
    fn max_priority_filter_applies() {
        let store = test_store();
        seed(&store);
        let filters = SearchFilters {
            max_priority: Some(1),
            ..Default::default()
        };
        let rows = store.keyword_search("rust quantum", &filters, 20).unwrap();
        assert!(rows.iter().all(|r| r.priority <= 1));
    }

    #[test]
    fn updated_after_filter_excludes_old() {
        let store = test_store();
        seed(&store);
        let future = (chrono::Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        let filters = SearchFilters {
            updated_after: Some(future),
            ..Default::default()
        };
        let rows = store.keyword_search("quantum", &filters, 20).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn like_fallback_handles_phrase_queries() {
        let store = test_store();
        seed(&store);
        // No FTS hit for this token, but a substring hit exists.
        let rows = store
            .keyword_search("ownership", &SearchFilters::default(), 20)
            .unwrap();
        assert!(!rows.is_empty());
    }

    #[test]
    fn vector_search_orders_by_similarity() {
        let store = test_store();
        seed(&store);
        let query = hash_embedding(
            "The quantum computer operates at very low temperatures",
            store.config.embedding.dim,
        );
        let rows = store
            .vector_search(&query, &SearchFilters::default(), 10)
            .unwrap();
        assert!(!rows.is_empty());
        assert_eq!(rows[0].path, "quantum");
        assert!(rows[0].semantic_score > 0.9);
    }

    #[test]
    fn snippet_centers_on_hit() {
        let text = format!("{} needle {}", "x".repeat(200), "y".repeat(200));
        let snippet = make_snippet(&text, "needle", 30);
        assert!(snippet.contains("needle"));
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert!(snippet.len() < 120);
    }
}
