//! Per-session runtime state: the recent-hit ring feeding session-first
//! search, and the flush tracker feeding context compaction.
//!
//! Both are ephemeral and process-local; they seed retrieval and compaction
//! but are never the source of truth.

use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::config::SessionConfig;

/// One recorded session touch (read, write, search hit).
#[derive(Debug, Clone)]
struct RecordedHit {
    uri: String,
    memory_id: Option<i64>,
    snippet: String,
    updated_at: String,
    priority: Option<i64>,
    source: String,
}

/// A scored session-ring match handed to the retrieval pipeline.
#[derive(Debug, Clone)]
pub struct SessionHit {
    pub uri: String,
    pub memory_id: Option<i64>,
    pub snippet: String,
    pub updated_at: String,
    pub priority: Option<i64>,
    pub source: String,
    pub score: f64,
    pub keyword_score: f64,
}

/// Bounded per-session ring of recently touched memories.
pub struct SessionCache {
    max_hits: usize,
    half_life_secs: f64,
    hits: Mutex<HashMap<String, VecDeque<RecordedHit>>>,
}

impl SessionCache {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            max_hits: config.cache_max_hits.max(20),
            half_life_secs: config.cache_half_life_secs.max(60) as f64,
            hits: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_hit(
        &self,
        session_id: &str,
        uri: &str,
        memory_id: Option<i64>,
        snippet: &str,
        priority: Option<i64>,
        source: &str,
        updated_at: Option<String>,
    ) {
        let snippet = snippet.trim();
        if uri.is_empty() || snippet.is_empty() {
            return;
        }
        let hit = RecordedHit {
            uri: uri.to_string(),
            memory_id,
            snippet: snippet.chars().take(300).collect(),
            updated_at: updated_at.unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            priority,
            source: source.to_string(),
        };
        let mut hits = self.hits.lock().await;
        let ring = hits.entry(session_id.to_string()).or_default();
        ring.push_back(hit);
        while ring.len() > self.max_hits {
            ring.pop_front();
        }
    }

    /// Score the ring against a query: token hits weighted with recency and
    /// priority, best entry per URI.
    pub async fn search(&self, session_id: &str, query: &str, limit: usize) -> Vec<SessionHit> {
        let terms = crate::retrieval::preprocess::tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let snapshot: Vec<RecordedHit> = {
            let hits = self.hits.lock().await;
            hits.get(session_id)
                .map(|ring| ring.iter().cloned().collect())
                .unwrap_or_default()
        };
        if snapshot.is_empty() {
            return Vec::new();
        }

        let now = chrono::Utc::now();
        let mut by_uri: HashMap<String, SessionHit> = HashMap::new();
        for item in snapshot {
            let text = item.snippet.to_lowercase();
            let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
            if hits == 0 {
                continue;
            }

            let text_score = (hits as f64 / terms.len() as f64).min(1.0);
            let age_secs = chrono::DateTime::parse_from_rfc3339(&item.updated_at)
                .map(|dt| (now - dt.with_timezone(&chrono::Utc)).num_seconds().max(0) as f64)
                .unwrap_or(0.0);
            let recency_score = (-age_secs / self.half_life_secs).exp();
            let priority_score = 1.0 / (1.0 + item.priority.unwrap_or(0).max(0) as f64);
            let score = 0.70 * text_score + 0.20 * recency_score + 0.10 * priority_score;

            let candidate = SessionHit {
                uri: item.uri.clone(),
                memory_id: item.memory_id,
                snippet: item.snippet.clone(),
                updated_at: item.updated_at.clone(),
                priority: item.priority,
                source: item.source.clone(),
                score,
                keyword_score: text_score,
            };
            match by_uri.get(&item.uri) {
                Some(existing) if existing.score >= score => {}
                _ => {
                    by_uri.insert(item.uri.clone(), candidate);
                }
            }
        }

        let mut ranked: Vec<SessionHit> = by_uri.into_values().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit.max(1));
        ranked
    }

    pub async fn clear_session(&self, session_id: &str) {
        self.hits.lock().await.remove(session_id);
    }
}

/// Accumulates session operation events and decides when a compaction flush
/// is warranted.
pub struct FlushTracker {
    trigger_chars: usize,
    min_events: usize,
    max_events: usize,
    events: Mutex<HashMap<String, VecDeque<String>>>,
}

impl FlushTracker {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            trigger_chars: config.flush_trigger_chars.max(800),
            min_events: config.flush_min_events.max(1),
            max_events: 80,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_event(&self, session_id: &str, message: &str) {
        let text = message.trim();
        if text.is_empty() {
            return;
        }
        let mut events = self.events.lock().await;
        let ring = events.entry(session_id.to_string()).or_default();
        ring.push_back(text.chars().take(400).collect());
        while ring.len() > self.max_events {
            ring.pop_front();
        }
    }

    pub async fn should_flush(&self, session_id: &str) -> bool {
        let events = self.events.lock().await;
        let Some(ring) = events.get(session_id) else {
            return false;
        };
        let total_chars: usize = ring.iter().map(|e| e.len()).sum();
        ring.len() >= self.min_events && total_chars >= self.trigger_chars
    }

    /// Compact trailing events into a flush summary.
    pub async fn build_summary(&self, session_id: &str, limit: usize) -> String {
        let events = self.events.lock().await;
        let Some(ring) = events.get(session_id) else {
            return String::new();
        };
        if ring.is_empty() {
            return String::new();
        }
        let tail: Vec<&String> = ring
            .iter()
            .rev()
            .take(limit.max(1))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let lines: Vec<String> = tail.iter().map(|e| format!("- {e}")).collect();
        format!("Session compaction notes:\n{}", lines.join("\n"))
    }

    pub async fn mark_flushed(&self, session_id: &str) {
        self.events.lock().await.remove(session_id);
    }
}
