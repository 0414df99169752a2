//! Remote model adapters: embeddings, rerank, and chat-style classification.
//!
//! All remote calls share one contract: a per-call timeout, bounded retries
//! with jittered exponential backoff, and graceful degradation — a failure
//! never surfaces as an error to the caller, it appends a degrade reason and
//! the pipeline falls back (hash embedding, keyword-only, no rerank).

use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::PalaceConfig;

const BACKOFF_BASE_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 4_000;

/// Append a degrade reason once.
pub fn push_degrade(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(reason.to_string());
    }
}

/// Deterministic local fallback embedding: sha256 token buckets, signed and
/// weighted, L2-normalized. Available even with no network at all.
pub fn hash_embedding(content: &str, dim: usize) -> Vec<f32> {
    let dim = dim.max(16);
    let mut vector = vec![0.0f32; dim];

    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut tokens: Vec<String> = normalized
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();
    if tokens.is_empty() && !normalized.is_empty() {
        tokens = normalized.chars().map(|c| c.to_string()).collect();
    }

    for token in &tokens {
        let digest = Sha256::digest(token.as_bytes());
        for i in (0..8).step_by(2) {
            let idx = digest[i] as usize % dim;
            let sign = if digest[i + 1] & 1 == 1 { -1.0 } else { 1.0 };
            let weight = 1.0 + (digest[(i + 2) % digest.len()] as f32 / 255.0);
            vector[idx] += sign * weight;
        }
    }

    l2_normalize(&mut vector);
    vector
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Shared HTTP client for the embedding/rerank/LLM endpoints.
pub struct RemoteClient {
    http: reqwest::Client,
    config: std::sync::Arc<PalaceConfig>,
}

impl RemoteClient {
    pub fn new(config: std::sync::Arc<PalaceConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(
                config.embedding.timeout_secs.max(1.0),
            ))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { http, config }
    }

    pub fn embedding_enabled(&self) -> bool {
        !matches!(self.config.embedding.backend.as_str(), "none")
    }

    fn embedding_is_remote(&self) -> bool {
        matches!(self.config.embedding.backend.as_str(), "router" | "api")
    }

    /// Embed content for indexing or querying. Remote backends fall back to
    /// the hash embedding on any failure; `none` yields no vector at all.
    pub async fn embed(&self, content: &str, degrade_reasons: &mut Vec<String>) -> Option<Vec<f32>> {
        if !self.embedding_enabled() {
            return None;
        }
        let dim = self.config.embedding.dim;
        if self.embedding_is_remote() {
            match self.fetch_remote_embedding(content, degrade_reasons).await {
                Some(mut vector) => {
                    if vector.len() != dim {
                        push_degrade(degrade_reasons, "embedding_dim_mismatch");
                        return Some(hash_embedding(content, dim));
                    }
                    l2_normalize(&mut vector);
                    return Some(vector);
                }
                None => {
                    push_degrade(degrade_reasons, "embedding_fallback_hash");
                    return Some(hash_embedding(content, dim));
                }
            }
        }
        Some(hash_embedding(content, dim))
    }

    /// Embed a query WITHOUT the hash fallback for remote backends: a remote
    /// failure drops the vector stage entirely so the pipeline can degrade
    /// `mode_applied` to keyword instead of silently mixing signal spaces.
    pub async fn embed_query(
        &self,
        content: &str,
        degrade_reasons: &mut Vec<String>,
    ) -> Option<Vec<f32>> {
        if !self.embedding_enabled() {
            return None;
        }
        let dim = self.config.embedding.dim;
        if self.embedding_is_remote() {
            let mut vector = self.fetch_remote_embedding(content, degrade_reasons).await?;
            if vector.len() != dim {
                push_degrade(degrade_reasons, "embedding_dim_mismatch");
                return None;
            }
            l2_normalize(&mut vector);
            return Some(vector);
        }
        Some(hash_embedding(content, dim))
    }

    async fn fetch_remote_embedding(
        &self,
        content: &str,
        degrade_reasons: &mut Vec<String>,
    ) -> Option<Vec<f32>> {
        let base = self.config.embedding.api_base.trim();
        let model = self.config.embedding.model.trim();
        if base.is_empty() || model.is_empty() {
            push_degrade(degrade_reasons, "embedding_config_missing");
            return None;
        }

        let payload = json!({ "model": model, "input": content });
        let response = self
            .post_json(base, "/embeddings", &payload, &self.config.embedding.api_key)
            .await;
        let Some(response) = response else {
            push_degrade(degrade_reasons, "embedding_request_failed");
            return None;
        };

        match extract_embedding(&response) {
            Some(vector) => Some(vector),
            None => {
                push_degrade(degrade_reasons, "embedding_response_invalid");
                None
            }
        }
    }

    /// Score documents against a query with the remote reranker. Returns a
    /// map from document index to a [0,1] score; empty on any failure.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        degrade_reasons: &mut Vec<String>,
    ) -> std::collections::HashMap<usize, f64> {
        if !self.config.reranker.enabled || documents.is_empty() {
            return Default::default();
        }
        let base = self.config.reranker.api_base.trim();
        let model = self.config.reranker.model.trim();
        if base.is_empty() || model.is_empty() {
            push_degrade(degrade_reasons, "reranker_config_missing");
            return Default::default();
        }

        let payload = json!({ "model": model, "query": query, "documents": documents });
        let response = self
            .post_json(base, "/rerank", &payload, &self.config.reranker.api_key)
            .await;
        let Some(response) = response else {
            push_degrade(degrade_reasons, "reranker_request_failed");
            return Default::default();
        };

        let scores = extract_rerank_scores(&response, documents.len());
        if scores.is_empty() {
            push_degrade(degrade_reasons, "reranker_response_invalid");
        }
        scores
    }

    /// Bounded chat-style call; returns the assistant message text.
    pub async fn chat(
        &self,
        api_base: &str,
        api_key: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Option<String> {
        if api_base.trim().is_empty() || model.trim().is_empty() {
            return None;
        }
        let payload = json!({
            "model": model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });
        let response = self
            .post_json(api_base, "/chat/completions", &payload, api_key)
            .await?;
        extract_chat_text(&response)
    }

    async fn post_json(
        &self,
        base: &str,
        endpoint: &str,
        payload: &Value,
        api_key: &str,
    ) -> Option<Value> {
        let url = join_api_url(base, endpoint);
        let max_retries = self.config.embedding.max_retries;

        for attempt in 0..=max_retries {
            let mut request = self.http.post(&url).json(payload);
            if !api_key.is_empty() {
                request = request
                    .bearer_auth(api_key)
                    .header("X-API-Key", api_key);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Value>().await {
                        Ok(parsed) => return Some(parsed),
                        Err(e) => {
                            tracing::debug!(url = %url, error = %e, "remote response not JSON");
                            return None;
                        }
                    }
                }
                Ok(response) => {
                    tracing::debug!(url = %url, status = %response.status(), "remote call failed");
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "remote call error");
                }
            }

            if attempt < max_retries {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }
        None
    }
}

/// `BASE × 2^attempt` with full jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(MAX_BACKOFF_MS);
    let jittered = rand::thread_rng().gen_range(0..=capped);
    Duration::from_millis(jittered)
}

fn join_api_url(base: &str, endpoint: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), endpoint)
}

/// Tolerant extraction across the common embedding response shapes.
fn extract_embedding(payload: &Value) -> Option<Vec<f32>> {
    let candidates = [
        payload.pointer("/data/0/embedding"),
        payload.get("embedding"),
        payload.pointer("/result/embedding"),
        payload.pointer("/result/data/0/embedding"),
        payload.pointer("/data/0"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(values) = candidate.as_array() {
            let parsed: Option<Vec<f32>> = values
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if let Some(vector) = parsed {
                if !vector.is_empty() {
                    return Some(vector);
                }
            }
        }
    }
    None
}

/// Parse rerank rows into index → normalized score; best score wins on dups.
fn extract_rerank_scores(
    payload: &Value,
    total_documents: usize,
) -> std::collections::HashMap<usize, f64> {
    let mut scores = std::collections::HashMap::new();
    if total_documents == 0 {
        return scores;
    }

    let rows = payload
        .get("results")
        .or_else(|| payload.get("data"))
        .or_else(|| payload.pointer("/result/results"))
        .or_else(|| payload.pointer("/result/data"))
        .and_then(|v| v.as_array());
    let Some(rows) = rows else {
        return scores;
    };

    for row in rows {
        let idx = row
            .get("index")
            .or_else(|| row.get("document_index"))
            .and_then(|v| v.as_i64());
        let Some(idx) = idx else { continue };
        if idx < 0 || idx as usize >= total_documents {
            continue;
        }
        let raw = row
            .get("score")
            .or_else(|| row.get("relevance_score"))
            .and_then(|v| v.as_f64());
        let Some(raw) = raw else { continue };
        let normalized = normalize_unit_score(raw);
        let entry = scores.entry(idx as usize).or_insert(normalized);
        if normalized > *entry {
            *entry = normalized;
        }
    }
    scores
}

/// Map arbitrary scores into [0,1]: pass-through, [-1,1] rescale, or sigmoid.
fn normalize_unit_score(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        return 0.0;
    }
    if (0.0..=1.0).contains(&value) {
        return value;
    }
    if (-1.0..=1.0).contains(&value) {
        return (value + 1.0) / 2.0;
    }
    1.0 / (1.0 + (-value).exp())
}

fn extract_chat_text(payload: &Value) -> Option<String> {
    let text = payload
        .pointer("/choices/0/message/content")
        .or_else(|| payload.pointer("/message/content"))
        .or_else(|| payload.get("content"))
        .and_then(|v| v.as_str())?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse the first JSON object out of a chat reply, tolerating code fences.
pub fn parse_chat_json_object(raw: &str) -> Option<Value> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&cleaned[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let a = hash_embedding("rust memory palace", 64);
        let b = hash_embedding("rust memory palace", 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedding_distinguishes_content() {
        let a = hash_embedding("completely different topic", 64);
        let b = hash_embedding("unrelated other subject", 64);
        assert!(cosine_similarity(&a, &b) < 0.99);
    }

    #[test]
    fn similar_content_scores_higher_than_unrelated() {
        let a = hash_embedding("prefer concise code in reviews", 64);
        let near = hash_embedding("prefer concise code in reviews please", 64);
        let far = hash_embedding("quarterly budget spreadsheet totals", 64);
        assert!(cosine_similarity(&a, &near) > cosine_similarity(&a, &far));
    }

    #[test]
    fn cosine_of_identical_is_one() {
        let v = hash_embedding("same", 32);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn extract_embedding_handles_openai_shape() {
        let payload = json!({"data": [{"embedding": [0.1, 0.2, 0.3]}]});
        let vector = extract_embedding(&payload).unwrap();
        assert_eq!(vector.len(), 3);

        let flat = json!({"embedding": [1.0, 2.0]});
        assert_eq!(extract_embedding(&flat).unwrap().len(), 2);

        assert!(extract_embedding(&json!({"data": []})).is_none());
    }

    #[test]
    fn extract_rerank_scores_normalizes_and_bounds() {
        let payload = json!({"results": [
            {"index": 0, "relevance_score": 0.9},
            {"index": 1, "score": -0.5},
            {"index": 7, "score": 0.4},
            {"document_index": 2, "score": 12.0},
        ]});
        let scores = extract_rerank_scores(&payload, 3);
        assert!((scores[&0] - 0.9).abs() < 1e-9);
        assert!((scores[&1] - 0.25).abs() < 1e-9);
        assert!(scores[&2] > 0.99); // sigmoid of 12
        assert!(!scores.contains_key(&7)); // out of range
    }

    #[test]
    fn normalize_unit_score_edges() {
        assert_eq!(normalize_unit_score(f64::NAN), 0.0);
        assert_eq!(normalize_unit_score(0.5), 0.5);
        assert_eq!(normalize_unit_score(-1.0), 0.0);
        assert!(normalize_unit_score(-30.0) < 0.01);
    }

    #[test]
    fn parse_chat_json_tolerates_fences_and_prose() {
        let fenced = "```json\n{\"action\": \"NOOP\"}\n```";
        assert_eq!(parse_chat_json_object(fenced).unwrap()["action"], "NOOP");

        let prose = "Sure! Here is the verdict: {\"action\": \"ADD\", \"reason\": \"new\"} done.";
        assert_eq!(parse_chat_json_object(prose).unwrap()["action"], "ADD");

        assert!(parse_chat_json_object("no json here").is_none());
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..10 {
            assert!(backoff_delay(attempt) <= Duration::from_millis(MAX_BACKOFF_MS));
        }
    }

    #[test]
    fn push_degrade_dedupes() {
        let mut reasons = Vec::new();
        push_degrade(&mut reasons, "embedding_request_failed");
        push_degrade(&mut reasons, "embedding_request_failed");
        assert_eq!(reasons.len(), 1);
    }
}
