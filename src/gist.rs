//! Gist generation and persistence.
//!
//! A gist is a compact summary of a memory body, keyed by the source content
//! hash so stale gists are rewritten when content changes. Generation runs a
//! deterministic fallback chain: llm_gist → extractive_bullets →
//! sentence_fallback → truncate_fallback. Every rung records its method tag
//! and a quality score in [0,1].

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::errors::Result;
use crate::remote::{push_degrade, RemoteClient};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct Gist {
    pub gist_text: String,
    pub gist_method: String,
    pub quality: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degrade_reasons: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct GistStats {
    pub total_gists: i64,
    pub memories_with_gists: i64,
    pub method_breakdown: Vec<(String, i64)>,
    pub avg_quality: f64,
}

fn trim_sentence(text: &str, limit: usize) -> String {
    let cleaned: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= limit {
        return cleaned;
    }
    let cut: String = cleaned.chars().take(limit.saturating_sub(3).max(8)).collect();
    format!("{}...", cut.trim_end())
}

/// Build a gist from a session summary with the deterministic fallback chain.
pub async fn generate_gist(
    remote: &RemoteClient,
    config: &crate::config::PalaceConfig,
    summary: &str,
    max_points: usize,
    max_chars: usize,
) -> Gist {
    let source = summary.trim();
    if source.is_empty() {
        return Gist {
            gist_text: String::new(),
            gist_method: "empty".into(),
            quality: 0.0,
            degrade_reasons: Vec::new(),
        };
    }

    let mut degrade_reasons = Vec::new();

    // 1. LLM gist
    let (api_base, api_key, model) = config.gist_llm();
    if !api_base.is_empty() && !model.is_empty() {
        let system_prompt = "You compress session notes into a short gist. \
                             Reply with the gist text only, at most three clauses.";
        let user_prompt = format!("Summarize in under {max_chars} characters:\n{source}");
        match remote
            .chat(&api_base, &api_key, &model, system_prompt, &user_prompt)
            .await
        {
            Some(text) if !text.trim().is_empty() => {
                return Gist {
                    gist_text: trim_sentence(&text, max_chars.max(40)),
                    gist_method: "llm_gist".into(),
                    quality: 0.72,
                    degrade_reasons,
                };
            }
            Some(_) | None => {
                push_degrade(&mut degrade_reasons, "compact_gist_llm_empty");
            }
        }
    }

    // 2. Extractive bullets
    let bullets: Vec<String> = source
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with("Session compaction notes:"))
        .map(|line| line.strip_prefix("- ").unwrap_or(line))
        .take(max_points.max(1))
        .map(|line| trim_sentence(line, 90))
        .collect();
    let extractive = bullets.join("; ");
    if !extractive.is_empty() && bullets.len() > 1 {
        let gist_text = trim_sentence(&extractive, max_chars.max(40));
        let quality = (gist_text.len() as f64 / (source.len() as f64 * 0.8).max(120.0))
            .clamp(0.45, 0.95);
        return Gist {
            gist_text,
            gist_method: "extractive_bullets".into(),
            quality,
            degrade_reasons,
        };
    }

    // 3. First sentence
    let flattened: String = source.split_whitespace().collect::<Vec<_>>().join(" ");
    let sentence = flattened
        .split_inclusive(['.', '!', '?'])
        .next()
        .unwrap_or(&flattened);
    if !sentence.trim().is_empty() && sentence.len() < flattened.len() {
        return Gist {
            gist_text: trim_sentence(sentence, max_chars.max(48)),
            gist_method: "sentence_fallback".into(),
            quality: 0.52,
            degrade_reasons,
        };
    }

    // 4. Plain truncation
    Gist {
        gist_text: trim_sentence(&flattened, max_chars.max(32)),
        gist_method: "truncate_fallback".into(),
        quality: 0.3,
        degrade_reasons,
    }
}

impl Store {
    /// Upsert a gist keyed on (memory_id, source_content_hash).
    pub fn upsert_memory_gist(
        &self,
        memory_id: i64,
        gist_text: &str,
        source_hash: &str,
        gist_method: &str,
        quality: f64,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO memory_gists \
             (memory_id, gist_text, source_content_hash, gist_method, quality_score, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(memory_id, source_content_hash) DO UPDATE SET \
             gist_text = excluded.gist_text, \
             gist_method = excluded.gist_method, \
             quality_score = excluded.quality_score",
            params![
                memory_id,
                gist_text,
                source_hash,
                gist_method,
                quality,
                Store::now_iso()
            ],
        )?;
        Ok(())
    }

    /// Latest gist for a memory, if any.
    pub fn latest_memory_gist(&self, memory_id: i64) -> Result<Option<(String, String, f64)>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT gist_text, gist_method, COALESCE(quality_score, 0.0) \
                 FROM memory_gists WHERE memory_id = ?1 ORDER BY id DESC LIMIT 1",
                params![memory_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn gist_stats(&self) -> Result<GistStats> {
        let conn = self.conn();
        let (total, memories, avg): (i64, i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT memory_id), AVG(quality_score) FROM memory_gists",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut stmt = conn.prepare(
            "SELECT gist_method, COUNT(*) FROM memory_gists GROUP BY gist_method ORDER BY 2 DESC",
        )?;
        let method_breakdown = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(GistStats {
            total_gists: total,
            memories_with_gists: memories,
            method_breakdown,
            avg_quality: avg.unwrap_or(0.0),
        })
    }
}
