//! Write Guard — pre-write classification of proposed content.
//!
//! The guard is a pure decision function over the store view at call time: it
//! never mutates anything. The ladder runs semantic similarity, then token-set
//! Jaccard, then optional LLM arbitration, and defaults to ADD. Classifier
//! failures degrade (the write proceeds as ADD with a `fallback` method tag).

use rusqlite::params;
use serde::Serialize;
use std::collections::HashSet;

use crate::config::PalaceConfig;
use crate::errors::Result;
use crate::remote::{push_degrade, RemoteClient};
use crate::store::{embedding_to_bytes, l2_to_cosine, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardAction {
    Add,
    Update,
    Noop,
    Delete,
    Bypass,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Noop => "NOOP",
            Self::Delete => "DELETE",
            Self::Bypass => "BYPASS",
        }
    }
}

/// Guard verdict, surfaced verbatim in write responses.
#[derive(Debug, Clone, Serialize)]
pub struct GuardDecision {
    pub action: GuardAction,
    pub target_id: Option<i64>,
    pub target_uri: Option<String>,
    pub method: String,
    pub reason: String,
    pub confidence: f64,
    pub degraded: bool,
    pub degrade_reasons: Vec<String>,
}

impl GuardDecision {
    fn new(action: GuardAction, method: &str, reason: String, confidence: f64) -> Self {
        Self {
            action,
            target_id: None,
            target_uri: None,
            method: method.to_string(),
            reason,
            confidence,
            degraded: false,
            degrade_reasons: Vec::new(),
        }
    }

    fn with_target(mut self, target_id: i64, target_uri: Option<String>) -> Self {
        self.target_id = Some(target_id);
        self.target_uri = target_uri;
        self
    }

    fn with_degrades(mut self, reasons: Vec<String>) -> Self {
        self.degraded = !reasons.is_empty();
        self.degrade_reasons = reasons;
        self
    }

    /// Metadata-only updates bypass the ladder entirely.
    pub fn bypass() -> Self {
        Self::new(
            GuardAction::Bypass,
            "bypass",
            "metadata_only_update".into(),
            1.0,
        )
    }

    /// All classifiers failed; the write proceeds as ADD.
    pub fn fallback(reason: String, degrade_reasons: Vec<String>) -> Self {
        Self::new(GuardAction::Add, "fallback", reason, 0.0).with_degrades(degrade_reasons)
    }

    /// True when the verdict should block a create/update in favor of an
    /// existing memory.
    pub fn blocks_create(&self) -> bool {
        matches!(
            self.action,
            GuardAction::Noop | GuardAction::Update | GuardAction::Delete
        )
    }
}

/// A proposed content write, scoped to where it would land.
pub struct GuardProposal<'a> {
    pub content: &'a str,
    pub domain: &'a str,
    pub path_prefix: Option<&'a str>,
    pub exclude_memory_id: Option<i64>,
}

/// A candidate existing memory, with whichever scores applied.
#[derive(Debug, Clone)]
pub struct GuardCandidate {
    pub memory_id: i64,
    pub uri: Option<String>,
    pub content: String,
    pub score: f64,
}

pub fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// The "supersedes" heuristic: a near-duplicate proposal counts as an update
/// when it is substantially longer or shares most of its tokens.
fn supersedes(config: &PalaceConfig, proposal: &str, existing: &str) -> bool {
    if (proposal.len() as f64) > (existing.len() as f64) * config.guard.supersede_length_ratio {
        return true;
    }
    let overlap = jaccard(&token_set(proposal), &token_set(existing));
    overlap >= config.guard.supersede_overlap
}

/// Run the decision ladder for a proposed content write.
pub async fn evaluate_guard(
    store: &Store,
    remote: &RemoteClient,
    proposal: &GuardProposal<'_>,
) -> GuardDecision {
    let config = &store.config;
    let content = proposal.content.trim();
    if content.is_empty() {
        return GuardDecision::new(GuardAction::Noop, "keyword", "empty_content".into(), 1.0);
    }

    let mut degrade_reasons: Vec<String> = Vec::new();
    let mut semantic_failed = false;
    let mut keyword_failed = false;

    // 1. Semantic rung
    let mut semantic_candidates: Vec<GuardCandidate> = Vec::new();
    if remote.embedding_enabled() {
        match remote.embed(content, &mut degrade_reasons).await {
            Some(embedding) => {
                match store.semantic_guard_candidates(
                    &embedding,
                    proposal.domain,
                    proposal.path_prefix,
                    proposal.exclude_memory_id,
                    config.guard.candidate_pool,
                ) {
                    Ok(candidates) => semantic_candidates = candidates,
                    Err(e) => {
                        semantic_failed = true;
                        push_degrade(&mut degrade_reasons, "write_guard_exception");
                        tracing::warn!(error = %e, "semantic guard lookup failed");
                    }
                }
            }
            None => semantic_failed = true,
        }
    } else {
        semantic_failed = true;
    }

    if let Some(top) = semantic_candidates.first() {
        if top.score >= config.guard.sem_noop_threshold {
            return GuardDecision::new(
                GuardAction::Noop,
                "embedding",
                format!(
                    "semantic similarity {:.3} >= {:.3}",
                    top.score, config.guard.sem_noop_threshold
                ),
                top.score,
            )
            .with_target(top.memory_id, top.uri.clone())
            .with_degrades(degrade_reasons);
        }
        if top.score >= config.guard.sem_update_low && supersedes(config, content, &top.content) {
            return GuardDecision::new(
                GuardAction::Update,
                "embedding",
                format!(
                    "semantic similarity {:.3} in update band, proposal supersedes",
                    top.score
                ),
                top.score,
            )
            .with_target(top.memory_id, top.uri.clone())
            .with_degrades(degrade_reasons);
        }
    }

    // 2. Keyword rung: token-set Jaccard over normalized content
    let mut keyword_candidates: Vec<GuardCandidate> = Vec::new();
    match store.keyword_guard_candidates(
        content,
        proposal.domain,
        proposal.path_prefix,
        proposal.exclude_memory_id,
        config.guard.candidate_pool,
    ) {
        Ok(candidates) => keyword_candidates = candidates,
        Err(e) => {
            keyword_failed = true;
            push_degrade(&mut degrade_reasons, "write_guard_exception");
            tracing::warn!(error = %e, "keyword guard lookup failed");
        }
    }

    if let Some(top) = keyword_candidates.first() {
        if top.score >= config.guard.kw_noop_threshold {
            return GuardDecision::new(
                GuardAction::Noop,
                "keyword",
                format!(
                    "token jaccard {:.3} >= {:.3}",
                    top.score, config.guard.kw_noop_threshold
                ),
                top.score,
            )
            .with_target(top.memory_id, top.uri.clone())
            .with_degrades(degrade_reasons);
        }
        if top.score >= config.guard.kw_update_threshold && supersedes(config, content, &top.content)
        {
            return GuardDecision::new(
                GuardAction::Update,
                "keyword",
                format!(
                    "token jaccard {:.3} in update band, proposal supersedes",
                    top.score
                ),
                top.score,
            )
            .with_target(top.memory_id, top.uri.clone())
            .with_degrades(degrade_reasons);
        }
    }

    // 3. Optional LLM arbitration over the undecided middle ground
    let best_signal = semantic_candidates
        .first()
        .map(|c| c.score)
        .into_iter()
        .chain(keyword_candidates.first().map(|c| c.score))
        .fold(0.0f64, f64::max);
    if config.llm.guard_enabled && best_signal >= config.guard.llm_consult_threshold {
        if let Some(decision) = llm_arbitrate(
            remote,
            config,
            content,
            &semantic_candidates,
            &keyword_candidates,
            &mut degrade_reasons,
        )
        .await
        {
            return decision.with_degrades(degrade_reasons);
        }
    }

    // 4. Default ADD
    if semantic_failed && keyword_failed {
        return GuardDecision::fallback("all classifiers unavailable".into(), degrade_reasons);
    }
    let method = if semantic_failed { "keyword" } else { "embedding" };
    GuardDecision::new(
        GuardAction::Add,
        method,
        "no strong duplicate signal".into(),
        1.0 - best_signal,
    )
    .with_degrades(degrade_reasons)
}

async fn llm_arbitrate(
    remote: &RemoteClient,
    config: &PalaceConfig,
    content: &str,
    semantic: &[GuardCandidate],
    keyword: &[GuardCandidate],
    degrade_reasons: &mut Vec<String>,
) -> Option<GuardDecision> {
    let mut shortlist: Vec<&GuardCandidate> = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();
    for candidate in semantic.iter().chain(keyword.iter()) {
        if seen.insert(candidate.memory_id) {
            shortlist.push(candidate);
        }
        if shortlist.len() >= 5 {
            break;
        }
    }
    if shortlist.is_empty() {
        push_degrade(degrade_reasons, "write_guard_llm_no_candidates");
        return None;
    }

    let candidate_lines: Vec<String> = shortlist
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. memory_id={} uri={} score={:.3} snippet={}",
                i + 1,
                c.memory_id,
                c.uri.as_deref().unwrap_or("(orphan)"),
                c.score,
                crate::store::memory::snippet(&c.content, 220),
            )
        })
        .collect();

    let system_prompt = "You are a write guard for a memory system. \
         Return strict JSON only with keys: action, target_id, reason. \
         Allowed action: ADD, UPDATE, NOOP, DELETE.";
    let user_prompt = format!(
        "New content:\n{content}\n\nCandidate memories:\n{}\n\n\
         Decide whether this should be added, should update an existing memory, \
         is a no-op duplicate, or marks something for deletion.",
        candidate_lines.join("\n")
    );

    let reply = remote
        .chat(
            &config.llm.api_base,
            &config.llm.api_key,
            &config.llm.model,
            system_prompt,
            &user_prompt,
        )
        .await;
    let Some(reply) = reply else {
        push_degrade(degrade_reasons, "write_guard_llm_request_failed");
        return None;
    };
    let Some(parsed) = crate::remote::parse_chat_json_object(&reply) else {
        push_degrade(degrade_reasons, "write_guard_llm_response_invalid");
        return None;
    };

    let action = match parsed.get("action").and_then(|v| v.as_str()) {
        Some("ADD") => GuardAction::Add,
        Some("UPDATE") => GuardAction::Update,
        Some("NOOP") => GuardAction::Noop,
        Some("DELETE") => GuardAction::Delete,
        _ => {
            push_degrade(degrade_reasons, "write_guard_llm_action_invalid");
            return None;
        }
    };
    let target_id = parsed
        .get("target_id")
        .and_then(|v| v.as_i64())
        .filter(|id| *id > 0);
    let reason = parsed
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("llm_decision")
        .to_string();
    let target_uri = target_id.and_then(|id| {
        shortlist
            .iter()
            .find(|c| c.memory_id == id)
            .and_then(|c| c.uri.clone())
    });

    let mut decision = GuardDecision::new(action, "llm", reason, 0.5);
    if let Some(id) = target_id {
        decision = decision.with_target(id, target_uri);
    }
    Some(decision)
}

impl Store {
    /// Nearest existing memories by chunk-vector cosine, best chunk per
    /// memory, scoped to domain/prefix, excluding the memory being edited.
    pub fn semantic_guard_candidates(
        &self,
        embedding: &[f32],
        domain: &str,
        path_prefix: Option<&str>,
        exclude_memory_id: Option<i64>,
        pool: usize,
    ) -> Result<Vec<GuardCandidate>> {
        // KNN over the vec0 table alone (the LIMIT must bind to the vector
        // scan), then hydrate the owning memories separately.
        let knn: Vec<(i64, f64)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT chunk_id, distance FROM chunks_vec \
                 WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![embedding_to_bytes(embedding), (pool * 8) as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut best: Vec<GuardCandidate> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();
        for (chunk_id, distance) in knn {
            let memory_id: Option<i64> = {
                let conn = self.conn();
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT memory_id FROM memory_chunks WHERE id = ?1",
                    params![chunk_id],
                    |row| row.get(0),
                )
                .optional()?
            };
            let Some(memory_id) = memory_id else { continue };
            if Some(memory_id) == exclude_memory_id || !seen.insert(memory_id) {
                continue;
            }
            let Some(candidate) =
                self.load_guard_candidate(memory_id, domain, path_prefix, l2_to_cosine(distance))?
            else {
                continue;
            };
            best.push(candidate);
            if best.len() >= pool {
                break;
            }
        }
        best.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(best)
    }

    /// FTS recall pool re-scored with token-set Jaccard against the proposal.
    pub fn keyword_guard_candidates(
        &self,
        content: &str,
        domain: &str,
        path_prefix: Option<&str>,
        exclude_memory_id: Option<i64>,
        pool: usize,
    ) -> Result<Vec<GuardCandidate>> {
        let proposal_tokens = token_set(content);
        if proposal_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let fts_query = proposal_tokens
            .iter()
            .take(16)
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");

        let memory_ids: Vec<i64> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT mc.memory_id FROM chunks_fts \
                 JOIN memory_chunks mc ON mc.id = chunks_fts.rowid \
                 WHERE chunks_fts MATCH ?1 ORDER BY chunks_fts.rank LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![fts_query, (pool * 8) as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut candidates = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();
        for memory_id in memory_ids {
            if Some(memory_id) == exclude_memory_id || !seen.insert(memory_id) {
                continue;
            }
            let Some(mut candidate) =
                self.load_guard_candidate(memory_id, domain, path_prefix, 0.0)?
            else {
                continue;
            };
            candidate.score = jaccard(&proposal_tokens, &token_set(&candidate.content));
            candidates.push(candidate);
        }
        candidates
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(pool);
        Ok(candidates)
    }

    /// Load one candidate if it is live and visible in the given scope.
    fn load_guard_candidate(
        &self,
        memory_id: i64,
        domain: &str,
        path_prefix: Option<&str>,
        score: f64,
    ) -> Result<Option<GuardCandidate>> {
        let Some(memory) = self.get_memory_by_id(memory_id)? else {
            return Ok(None);
        };
        if memory.deprecated {
            return Ok(None);
        }
        let paths = self.paths_for_memory(memory_id)?;
        let scoped = paths.iter().find(|p| {
            p.domain == domain
                && path_prefix
                    .map(|prefix| p.path.starts_with(prefix))
                    .unwrap_or(true)
        });
        if scoped.is_none() {
            return Ok(None);
        }
        Ok(Some(GuardCandidate {
            memory_id,
            uri: scoped.map(|p| p.uri()),
            content: memory.content,
            score,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PalaceConfig;
    use std::sync::Arc;

    fn test_store(backend: &str) -> (Arc<Store>, RemoteClient) {
        let mut config = PalaceConfig::default();
        config.embedding.backend = backend.to_string();
        let config = Arc::new(config);
        let conn = crate::db::open_memory_database(config.embedding.dim).unwrap();
        let store = Arc::new(Store::new(conn, Arc::clone(&config)));
        let remote = RemoteClient::new(config);
        (store, remote)
    }

    #[tokio::test]
    async fn identical_content_is_noop() {
        let (store, remote) = test_store("hash");
        store
            .create_memory("core", "", "Prefer concise code", 1, Some("style"), None, true)
            .unwrap();

        let decision = evaluate_guard(
            &store,
            &remote,
            &GuardProposal {
                content: "Prefer concise code",
                domain: "core",
                path_prefix: None,
                exclude_memory_id: None,
            },
        )
        .await;

        assert_eq!(decision.action, GuardAction::Noop);
        assert_eq!(decision.target_uri.as_deref(), Some("core://style"));
        assert!(decision.method == "embedding" || decision.method == "keyword");
        assert!(decision.confidence > 0.9);
    }

    #[tokio::test]
    async fn unrelated_content_is_add() {
        let (store, remote) = test_store("hash");
        store
            .create_memory("core", "", "Prefer concise code", 1, Some("style"), None, true)
            .unwrap();

        let decision = evaluate_guard(
            &store,
            &remote,
            &GuardProposal {
                content: "Quarterly budget spreadsheet has seventeen tabs",
                domain: "core",
                path_prefix: None,
                exclude_memory_id: None,
            },
        )
        .await;

        assert_eq!(decision.action, GuardAction::Add);
    }

    #[tokio::test]
    async fn near_duplicate_superset_is_update() {
        let (store, remote) = test_store("none");
        store
            .create_memory(
                "core",
                "",
                "deploy checklist run tests tag release",
                0,
                Some("deploy"),
                None,
                true,
            )
            .unwrap();

        // Same tokens plus substantially more content: keyword rung, update band.
        let decision = evaluate_guard(
            &store,
            &remote,
            &GuardProposal {
                content: "deploy checklist run tests tag release then announce",
                domain: "core",
                path_prefix: None,
                exclude_memory_id: None,
            },
        )
        .await;

        assert_eq!(decision.action, GuardAction::Update);
        assert_eq!(decision.method, "keyword");
        assert!(decision.target_id.is_some());
    }

    #[tokio::test]
    async fn exclude_prevents_self_match() {
        let (store, remote) = test_store("hash");
        let created = store
            .create_memory("core", "", "self referential note", 0, Some("me"), None, true)
            .unwrap();

        let decision = evaluate_guard(
            &store,
            &remote,
            &GuardProposal {
                content: "self referential note",
                domain: "core",
                path_prefix: None,
                exclude_memory_id: Some(created.id),
            },
        )
        .await;

        assert_eq!(decision.action, GuardAction::Add);
    }

    #[tokio::test]
    async fn scope_filters_other_domains() {
        let (store, remote) = test_store("hash");
        store
            .create_memory("writer", "", "Prefer concise code", 0, Some("aside"), None, true)
            .unwrap();

        let decision = evaluate_guard(
            &store,
            &remote,
            &GuardProposal {
                content: "Prefer concise code",
                domain: "core",
                path_prefix: None,
                exclude_memory_id: None,
            },
        )
        .await;

        // The duplicate lives in another domain, so the core write proceeds.
        assert_eq!(decision.action, GuardAction::Add);
    }

    #[tokio::test]
    async fn empty_content_is_noop() {
        let (store, remote) = test_store("hash");
        let decision = evaluate_guard(
            &store,
            &remote,
            &GuardProposal {
                content: "   ",
                domain: "core",
                path_prefix: None,
                exclude_memory_id: None,
            },
        )
        .await;
        assert_eq!(decision.action, GuardAction::Noop);
        assert_eq!(decision.reason, "empty_content");
    }

    #[test]
    fn jaccard_basics() {
        let a = token_set("alpha beta gamma");
        let b = token_set("alpha beta delta");
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-9);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&token_set(""), &token_set("")), 0.0);
    }

    #[test]
    fn bypass_decision_shape() {
        let decision = GuardDecision::bypass();
        assert_eq!(decision.action, GuardAction::Bypass);
        assert_eq!(decision.method, "bypass");
        assert!(!decision.blocks_create());
    }
}
