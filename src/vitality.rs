//! Vitality scoring: half-life decay, access reinforcement, and cleanup
//! candidate selection.
//!
//! Decay is idempotent per day — a `runtime_meta` day key records the last
//! run, so repeated ticks within a day change nothing. Scores live in
//! `[VITALITY_FLOOR, VITALITY_MAX]` and only accesses push them back up.

use rusqlite::params;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::Result;
use crate::store::memory::snippet;
use crate::store::Store;

const LAST_DECAY_DAY_KEY: &str = "vitality.last_decay_day";

#[derive(Debug, Serialize)]
pub struct DecayOutcome {
    pub applied: bool,
    pub day: String,
    pub checked_memories: usize,
    pub updated_memories: usize,
    pub low_vitality_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupCandidate {
    pub memory_id: i64,
    pub uri: Option<String>,
    pub path_count: i64,
    pub vitality_score: f64,
    pub access_count: i64,
    pub last_accessed_at: Option<String>,
    pub inactive_days: f64,
    pub content_snippet: String,
    pub can_delete: bool,
    pub state_hash: String,
}

#[derive(Debug, Serialize)]
pub struct VitalityStats {
    pub total_memories: i64,
    pub avg_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub low_vitality_count: i64,
    pub threshold: f64,
}

/// Hash of the reviewable state of a memory. Cleanup selections carry this so
/// confirm can detect any intervening mutation (`stale_state`).
pub fn state_hash(
    memory_id: i64,
    vitality_score: f64,
    access_count: i64,
    path_count: i64,
    deprecated: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{memory_id}|{vitality_score:.6}|{access_count}|{path_count}|{}",
        deprecated as u8
    ));
    format!("{:x}", hasher.finalize())
}

impl Store {
    /// Apply at most once-per-day vitality decay unless forced.
    ///
    /// `score ← max(floor, score × exp(-ln2 × Δdays / half_life))` where
    /// Δdays counts from the last access (or creation).
    pub fn apply_vitality_decay(&self, force: bool, reason: &str) -> Result<DecayOutcome> {
        let now = chrono::Utc::now();
        let day = now.format("%Y-%m-%d").to_string();

        let last_day = self.get_runtime_meta(LAST_DECAY_DAY_KEY)?;
        if !force && last_day.as_deref() == Some(day.as_str()) {
            return Ok(DecayOutcome {
                applied: false,
                day,
                checked_memories: 0,
                updated_memories: 0,
                low_vitality_count: 0,
            });
        }

        let gov = &self.config.governance;
        let half_life = gov.decay_half_life_days.max(1.0);
        let floor = gov.vitality_floor;
        let threshold = gov.cleanup_threshold;

        let mut checked = 0usize;
        let mut updated = 0usize;
        let mut low = 0usize;
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "SELECT id, vitality_score, COALESCE(last_accessed_at, created_at) \
                     FROM memories WHERE deprecated = 0",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                for (id, score, reference) in rows {
                    checked += 1;
                    let reference_dt = chrono::DateTime::parse_from_rfc3339(&reference)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or(now);
                    let age_days =
                        (now - reference_dt).num_seconds().max(0) as f64 / 86_400.0;
                    let ratio =
                        (-std::f64::consts::LN_2 * age_days / half_life).exp();
                    let next = (score * ratio).max(floor);
                    if next < score - 1e-9 {
                        tx.execute(
                            "UPDATE memories SET vitality_score = ?1 WHERE id = ?2",
                            params![next, id],
                        )?;
                        updated += 1;
                    }
                    if next <= threshold {
                        low += 1;
                    }
                }
            }
            tx.commit()?;
        }

        self.set_runtime_meta(LAST_DECAY_DAY_KEY, &day)?;
        self.set_runtime_meta("vitality.last_decay_reason", reason)?;
        self.set_runtime_meta("vitality.last_decay_at", &now.to_rfc3339())?;

        tracing::debug!(day = %day, checked, updated, low, "vitality decay applied");
        Ok(DecayOutcome {
            applied: true,
            day,
            checked_memories: checked,
            updated_memories: updated,
            low_vitality_count: low,
        })
    }

    /// Reinforce vitality when memories are read or retrieved: a bounded bump
    /// plus access accounting.
    pub fn reinforce_access(&self, memory_ids: &[i64]) -> Result<usize> {
        let mut ids: Vec<i64> = memory_ids.iter().copied().filter(|id| *id > 0).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(0);
        }

        let gov = &self.config.governance;
        let now = Store::now_iso();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut touched = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE memories SET \
                 access_count = access_count + 1, \
                 last_accessed_at = ?1, \
                 vitality_score = MIN(?2, vitality_score + ?3) \
                 WHERE id = ?4 AND deprecated = 0",
            )?;
            for id in &ids {
                touched += stmt.execute(params![
                    now,
                    gov.vitality_max,
                    gov.reinforce_delta,
                    id
                ])?;
            }
        }
        tx.commit()?;
        Ok(touched)
    }

    /// Low-vitality, inactive memories eligible for human cleanup review.
    ///
    /// With `memory_ids`, the threshold/inactivity filters are relaxed so
    /// prepare/confirm can re-fetch exact selections for hash verification.
    pub fn cleanup_candidates(
        &self,
        threshold: Option<f64>,
        inactive_days: Option<f64>,
        limit: usize,
        memory_ids: Option<&[i64]>,
    ) -> Result<Vec<CleanupCandidate>> {
        let gov = &self.config.governance;
        let threshold = threshold.unwrap_or(gov.cleanup_threshold);
        let inactive_days = inactive_days.unwrap_or(gov.cleanup_inactive_days);
        let limit = limit.clamp(1, 500);
        let now = chrono::Utc::now();
        let cutoff = (now - chrono::Duration::seconds((inactive_days * 86_400.0) as i64))
            .to_rfc3339();

        let conn = self.conn();
        let mut candidates = Vec::new();
        let mut push_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            let memory_id: i64 = row.get(0)?;
            let vitality: f64 = row.get(1)?;
            let access_count: i64 = row.get(2)?;
            let last_accessed: Option<String> = row.get(3)?;
            let created_at: String = row.get(4)?;
            let deprecated: i64 = row.get(5)?;
            let content: String = row.get(6)?;
            let path_count: i64 = row.get(7)?;
            let uri: Option<String> = row.get(8)?;

            let reference = last_accessed.clone().unwrap_or(created_at);
            let reference_dt = chrono::DateTime::parse_from_rfc3339(&reference)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or(now);
            let inactive = (now - reference_dt).num_seconds().max(0) as f64 / 86_400.0;

            candidates.push(CleanupCandidate {
                memory_id,
                uri,
                path_count,
                vitality_score: vitality,
                access_count,
                last_accessed_at: last_accessed,
                inactive_days: inactive,
                content_snippet: snippet(&content, 160),
                can_delete: path_count == 0 || deprecated != 0,
                state_hash: state_hash(
                    memory_id,
                    vitality,
                    access_count,
                    path_count,
                    deprecated != 0,
                ),
            });
            Ok(())
        };

        const CANDIDATE_SELECT: &str = "SELECT m.id, m.vitality_score, m.access_count, \
             m.last_accessed_at, m.created_at, m.deprecated, m.content, \
             (SELECT COUNT(*) FROM paths p WHERE p.memory_id = m.id), \
             (SELECT p.domain || '://' || p.path FROM paths p WHERE p.memory_id = m.id \
              ORDER BY p.priority ASC, p.path ASC LIMIT 1) \
             FROM memories m";

        match memory_ids {
            Some(ids) => {
                let mut stmt =
                    conn.prepare(&format!("{CANDIDATE_SELECT} WHERE m.id = ?1"))?;
                for id in ids.iter().take(limit) {
                    let mut rows = stmt.query(params![id])?;
                    while let Some(row) = rows.next()? {
                        push_row(row)?;
                    }
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{CANDIDATE_SELECT} \
                     WHERE m.deprecated = 0 AND m.vitality_score <= ?1 \
                       AND COALESCE(m.last_accessed_at, m.created_at) <= ?2 \
                     ORDER BY m.vitality_score ASC, \
                              COALESCE(m.last_accessed_at, m.created_at) ASC, m.id ASC \
                     LIMIT ?3"
                ))?;
                let mut rows = stmt.query(params![threshold, cutoff, limit as i64])?;
                while let Some(row) = rows.next()? {
                    push_row(row)?;
                }
            }
        }

        Ok(candidates)
    }

    /// Pin a memory's vitality to the configured maximum (cleanup "keep").
    pub fn bump_vitality_to_max(&self, memory_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE memories SET vitality_score = ?1, last_accessed_at = ?2 WHERE id = ?3",
            params![
                self.config.governance.vitality_max,
                Store::now_iso(),
                memory_id
            ],
        )?;
        Ok(())
    }

    pub fn vitality_stats(&self) -> Result<VitalityStats> {
        let threshold = self.config.governance.cleanup_threshold;
        let conn = self.conn();
        let (total, avg, min, max): (i64, Option<f64>, Option<f64>, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*), AVG(vitality_score), MIN(vitality_score), MAX(vitality_score) \
                 FROM memories WHERE deprecated = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let low: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE deprecated = 0 AND vitality_score <= ?1",
            params![threshold],
            |row| row.get(0),
        )?;
        Ok(VitalityStats {
            total_memories: total,
            avg_score: avg.unwrap_or(0.0),
            min_score: min.unwrap_or(0.0),
            max_score: max.unwrap_or(0.0),
            low_vitality_count: low,
            threshold,
        })
    }
}
