//! Multi-stage retrieval pipeline with intent routing and graceful
//! degradation.
//!
//! Stage order: preprocess → intent classify → strategy selection → keyword
//! stage → optional vector stage → merge → optional rerank → filter & cut.
//! Any degrade-tolerant stage that fails falls through and appends a reason;
//! a non-empty `degrade_reasons` never fails the request, it only sets
//! `degraded=true` and may weaken `mode_applied` below `mode_requested`.

pub mod intent;
pub mod preprocess;
pub mod search;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{PalaceError, Result};
use crate::remote::{push_degrade, RemoteClient};
use crate::session::SessionHit;
use crate::store::Store;
use intent::{classify_intent, template_for, temporal_window_days, IntentProfile};
use preprocess::{preprocess_query, QueryPreprocess};
use search::{make_snippet, CandidateRow, SearchFilters};

pub const MAX_RESULTS_CAP: usize = 50;
pub const CANDIDATE_MULTIPLIER_CAP: usize = 20;

/// A validated search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: Option<String>,
    pub max_results: Option<usize>,
    pub candidate_multiplier: Option<usize>,
    pub include_session: Option<bool>,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultScores {
    pub keyword: f64,
    pub semantic: f64,
    pub rerank: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub uri: String,
    pub memory_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<i64>,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_range: Option<(i64, i64)>,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclosure: Option<String>,
    pub updated_at: String,
    pub scores: ResultScores,
    /// `global` for store hits, `session` for session-ring hits.
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct SearchCounts {
    pub session: usize,
    pub global: usize,
    pub returned: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub ok: bool,
    pub query: String,
    pub query_effective: String,
    pub query_preprocess: QueryPreprocess,
    pub intent: String,
    pub intent_profile: IntentProfile,
    pub strategy_template: String,
    pub mode_requested: String,
    pub mode_applied: String,
    pub max_results: usize,
    pub candidate_multiplier: usize,
    pub counts: SearchCounts,
    pub results: Vec<SearchResultItem>,
    pub degrade_reasons: Vec<String>,
    pub degraded: bool,
}

pub struct SearchPipeline {
    store: Arc<Store>,
    remote: Arc<RemoteClient>,
}

impl SearchPipeline {
    pub fn new(store: Arc<Store>, remote: Arc<RemoteClient>) -> Self {
        Self { store, remote }
    }

    /// Run the full pipeline. `session_hits` is the caller's recent-session
    /// ring lookup (already scored); pass empty when session inclusion is off.
    pub async fn run(
        &self,
        request: &SearchRequest,
        session_hits: Vec<SessionHit>,
    ) -> Result<SearchResponse> {
        let config = &self.store.config;
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(PalaceError::InvalidArgument("query must not be empty".into()));
        }

        let max_results = request
            .max_results
            .unwrap_or(config.retrieval.default_max_results);
        if max_results == 0 || max_results > MAX_RESULTS_CAP {
            return Err(PalaceError::InvalidArgument(format!(
                "max_results must be in 1..={MAX_RESULTS_CAP}"
            )));
        }
        let requested_multiplier = request
            .candidate_multiplier
            .unwrap_or(config.retrieval.default_candidate_multiplier);
        if requested_multiplier == 0 || requested_multiplier > CANDIDATE_MULTIPLIER_CAP {
            return Err(PalaceError::InvalidArgument(format!(
                "candidate_multiplier must be in 1..={CANDIDATE_MULTIPLIER_CAP}"
            )));
        }

        let mode_requested = request
            .mode
            .clone()
            .unwrap_or_else(|| config.retrieval.default_mode.clone())
            .to_lowercase();
        if !matches!(mode_requested.as_str(), "keyword" | "semantic" | "hybrid") {
            return Err(PalaceError::InvalidArgument(format!(
                "invalid mode '{mode_requested}'; allowed: keyword, semantic, hybrid"
            )));
        }

        let mut degrade_reasons: Vec<String> = Vec::new();

        // 1. Preprocess
        let query_preprocess = preprocess_query(&query);
        let query_effective = if query_preprocess.rewritten_query.is_empty() {
            query.clone()
        } else {
            query_preprocess.rewritten_query.clone()
        };

        // 2-3. Intent → strategy template
        let intent_profile = classify_intent(&config.retrieval, &query, &query_effective);
        let template = template_for(intent_profile.intent);
        let multiplier = requested_multiplier
            .max(template.candidate_multiplier_floor)
            .min(template.candidate_multiplier_cap);
        let candidate_limit = max_results * multiplier;

        // Temporal routing narrows the time window.
        let mut filters = request.filters.clone();
        if template.time_window_days.is_some() && filters.updated_after.is_none() {
            let window = temporal_window_days(&config.retrieval, &query);
            filters.updated_after =
                Some((chrono::Utc::now() - chrono::Duration::days(window)).to_rfc3339());
        }

        // 4. Keyword stage
        let mut mode_applied = mode_requested.clone();
        let mut keyword_rows: Vec<CandidateRow> = Vec::new();
        if mode_requested != "semantic" {
            keyword_rows = self
                .store
                .keyword_search(&query_effective, &filters, candidate_limit)?;
        }

        // 5. Vector stage (optional, degrade-tolerant)
        let mut vector_rows: Vec<CandidateRow> = Vec::new();
        if mode_requested != "keyword" {
            if !self.remote.embedding_enabled() {
                push_degrade(&mut degrade_reasons, "vector_backend_disabled");
                mode_applied = "keyword".to_string();
            } else {
                match self
                    .remote
                    .embed_query(&query_effective, &mut degrade_reasons)
                    .await
                {
                    Some(embedding) => {
                        vector_rows =
                            self.store.vector_search(&embedding, &filters, candidate_limit)?;
                    }
                    None => {
                        mode_applied = "keyword".to_string();
                    }
                }
            }
            // A request for pure semantic that lost its vector stage still
            // answers from the keyword index.
            if mode_requested == "semantic" && mode_applied == "keyword" {
                keyword_rows = self
                    .store
                    .keyword_search(&query_effective, &filters, candidate_limit)?;
            }
        }

        // 6. Merge: union by (domain, path, chunk), max per-signal scores.
        let weights = self.merge_weights(&mode_applied, &template);
        let mut merged: HashMap<(String, String, Option<i64>), CandidateRow> = HashMap::new();
        for row in keyword_rows.into_iter().chain(vector_rows.into_iter()) {
            let key = (row.domain.clone(), row.path.clone(), row.chunk_id);
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.keyword_score = existing.keyword_score.max(row.keyword_score);
                    existing.semantic_score = existing.semantic_score.max(row.semantic_score);
                }
                None => {
                    merged.insert(key, row);
                }
            }
        }
        let mut candidates: Vec<CandidateRow> = merged.into_values().collect();

        // 7. Rerank (optional, degrade-tolerant)
        let mut rerank_scores: HashMap<usize, f64> = HashMap::new();
        if config.reranker.enabled && !candidates.is_empty() {
            let documents: Vec<String> =
                candidates.iter().map(|c| c.chunk_text.clone()).collect();
            rerank_scores = self
                .remote
                .rerank(&query_effective, &documents, &mut degrade_reasons)
                .await;
        }
        let rerank_weight = config.reranker.weight * template.rerank_weight_scale;

        // 8. Score, order, filter, cut
        let mut scored: Vec<(f64, f64, SearchResultItem)> = candidates
            .drain(..)
            .enumerate()
            .map(|(i, row)| {
                let rerank = rerank_scores.get(&i).copied().unwrap_or(0.0);
                let combined = weights.0 * row.keyword_score
                    + weights.1 * row.semantic_score.max(0.0)
                    + rerank_weight * rerank;
                let item = SearchResultItem {
                    uri: format!("{}://{}", row.domain, row.path),
                    memory_id: Some(row.memory_id),
                    chunk_id: row.chunk_id,
                    snippet: make_snippet(&row.chunk_text, &query_effective, 50),
                    char_range: Some((row.char_start, row.char_end)),
                    priority: row.priority,
                    disclosure: row.disclosure,
                    updated_at: row.updated_at,
                    scores: ResultScores {
                        keyword: row.keyword_score,
                        semantic: row.semantic_score,
                        rerank,
                        final_score: combined,
                    },
                    source: "global".to_string(),
                };
                (combined, rerank, item)
            })
            .filter(|(score, _, _)| *score >= template.min_score)
            .collect();

        // Tie-break: lower priority value wins, then newer, then lower id.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.2.priority.cmp(&b.2.priority))
                .then_with(|| b.2.updated_at.cmp(&a.2.updated_at))
                .then_with(|| a.2.memory_id.cmp(&b.2.memory_id))
        });

        let global_results: Vec<SearchResultItem> =
            scored.into_iter().map(|(_, _, item)| item).collect();
        let global_count = global_results.len();

        // Session inclusion: seeded candidates merge ahead, deduped by URI.
        let session_results: Vec<SearchResultItem> = session_hits
            .iter()
            .map(|hit| SearchResultItem {
                uri: hit.uri.clone(),
                memory_id: hit.memory_id,
                chunk_id: None,
                snippet: hit.snippet.clone(),
                char_range: None,
                priority: hit.priority.unwrap_or(0),
                disclosure: None,
                updated_at: hit.updated_at.clone(),
                scores: ResultScores {
                    keyword: hit.keyword_score,
                    semantic: 0.0,
                    rerank: 0.0,
                    final_score: hit.score,
                },
                source: "session".to_string(),
            })
            .collect();
        let session_count = session_results.len();

        let mut seen_uris: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut results: Vec<SearchResultItem> = Vec::new();
        for item in session_results.into_iter().chain(global_results.into_iter()) {
            if seen_uris.insert(item.uri.clone()) {
                results.push(item);
            }
            if results.len() >= max_results {
                break;
            }
        }

        // 9. Access reinforcement for returned store hits.
        let returned_ids: Vec<i64> = results
            .iter()
            .filter(|r| r.source == "global")
            .filter_map(|r| r.memory_id)
            .collect();
        if !returned_ids.is_empty() {
            if let Err(e) = self.store.reinforce_access(&returned_ids) {
                tracing::warn!(error = %e, "access reinforcement failed");
            }
        }

        let degraded = !degrade_reasons.is_empty();
        Ok(SearchResponse {
            ok: true,
            query,
            query_effective,
            query_preprocess,
            intent: intent_profile.intent.as_str().to_string(),
            strategy_template: template.name.to_string(),
            intent_profile,
            mode_requested,
            mode_applied,
            max_results,
            candidate_multiplier: multiplier,
            counts: SearchCounts {
                session: session_count,
                global: global_count,
                returned: results.len(),
            },
            results,
            degrade_reasons,
            degraded,
        })
    }

    /// (keyword_weight, semantic_weight) for the applied mode and template.
    fn merge_weights(
        &self,
        mode_applied: &str,
        template: &intent::StrategyTemplate,
    ) -> (f64, f64) {
        let config = &self.store.config;
        match mode_applied {
            "keyword" => (0.85, 0.0),
            "semantic" => (0.0, 0.85),
            _ => {
                if template.name == "default" {
                    (
                        config.retrieval.keyword_weight,
                        config.retrieval.semantic_weight,
                    )
                } else {
                    (template.keyword_weight, template.semantic_weight)
                }
            }
        }
    }
}
