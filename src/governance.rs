//! Governance loop: vitality decay ticks, the two-phase cleanup review
//! protocol, and the sleep-consolidation scheduler.
//!
//! Cleanup is deliberately human-gated. Phase one (prepare) pins the exact
//! store state of every selection behind a state hash and issues a one-shot
//! review (random id, token, confirmation phrase, TTL). Phase two (confirm)
//! re-verifies each selection against the live store and reports per-item
//! outcomes; anything that moved since prepare is skipped as `stale_state`.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::{PalaceError, Result};
use crate::store::Store;
use crate::worker::IndexWorker;

#[derive(Debug, Clone, Serialize)]
pub struct ReviewIssued {
    pub review_id: String,
    pub token: String,
    pub confirmation_phrase: String,
    pub expires_at: String,
    pub action: String,
    pub reviewer: String,
    pub selected_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ConfirmOutcome {
    pub status: String,
    pub action: String,
    pub review_id: String,
    pub reviewer: String,
    pub selected_count: usize,
    pub deleted_count: usize,
    pub kept_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub skipped: Vec<Value>,
    pub errors: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct CleanupSelection {
    pub memory_id: i64,
    pub state_hash: String,
}

/// Two-phase cleanup review coordinator, persisted in `cleanup_reviews`.
/// Prepare/confirm hold a short exclusive section; these are infrequent.
pub struct CleanupReviews {
    store: Arc<Store>,
    guard: Mutex<()>,
}

impl CleanupReviews {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    fn prune_expired(&self) -> Result<()> {
        let conn = self.store.conn();
        conn.execute(
            "DELETE FROM cleanup_reviews WHERE expires_at <= ?1",
            params![Store::now_iso()],
        )?;
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let _section = self.guard.lock().await;
        self.prune_expired()?;
        let conn = self.store.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM cleanup_reviews", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Phase one: validate selections against the live store and issue a
    /// one-shot review.
    pub async fn prepare(
        &self,
        action: &str,
        reviewer: Option<&str>,
        selections: &[CleanupSelection],
        ttl_secs: Option<u64>,
    ) -> Result<ReviewIssued> {
        let action = action.trim().to_lowercase();
        if !matches!(action.as_str(), "delete" | "keep") {
            return Err(PalaceError::InvalidArgument(
                "action must be one of: delete, keep".into(),
            ));
        }
        if selections.is_empty() {
            return Err(PalaceError::InvalidArgument(
                "at least one selection is required".into(),
            ));
        }

        let _section = self.guard.lock().await;
        self.prune_expired()?;

        let max_pending = self.store.config.governance.max_pending_reviews;
        let pending: i64 = {
            let conn = self.store.conn();
            conn.query_row("SELECT COUNT(*) FROM cleanup_reviews", [], |r| r.get(0))?
        };
        if pending as usize >= max_pending {
            return Err(PalaceError::PendingReviewsFull);
        }

        // Every selection's state hash must match the current store state.
        let ids: Vec<i64> = selections.iter().map(|s| s.memory_id).collect();
        let current = self
            .store
            .cleanup_candidates(None, None, ids.len().max(1), Some(&ids))?;
        let mut verified: Vec<Value> = Vec::new();
        for selection in selections {
            let Some(candidate) = current
                .iter()
                .find(|c| c.memory_id == selection.memory_id)
            else {
                return Err(PalaceError::StaleState(selection.memory_id));
            };
            if candidate.state_hash != selection.state_hash {
                return Err(PalaceError::StaleState(selection.memory_id));
            }
            verified.push(json!({
                "memory_id": candidate.memory_id,
                "state_hash": candidate.state_hash,
                "can_delete": candidate.can_delete,
                "uri": candidate.uri,
                "vitality_score": candidate.vitality_score,
            }));
        }

        let ttl = ttl_secs
            .unwrap_or(self.store.config.governance.review_ttl_secs)
            .clamp(60, 3600);
        let review_id = format!("cleanup-{}", &uuid::Uuid::new_v4().simple().to_string()[..10]);
        let token = uuid::Uuid::new_v4().simple().to_string();
        let phrase_nonce = &uuid::Uuid::new_v4().simple().to_string()[..6];
        let confirmation_phrase = format!(
            "CONFIRM {} {} {}",
            action.to_uppercase(),
            selections.len(),
            phrase_nonce
        );
        let reviewer = reviewer
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .unwrap_or("human")
            .to_string();
        let expires_at =
            (chrono::Utc::now() + chrono::Duration::seconds(ttl as i64)).to_rfc3339();

        {
            let conn = self.store.conn();
            conn.execute(
                "INSERT INTO cleanup_reviews \
                 (review_id, token, confirmation_phrase, action, reviewer, selections, \
                  created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    review_id,
                    token,
                    confirmation_phrase,
                    action,
                    reviewer,
                    serde_json::to_string(&verified).unwrap_or_default(),
                    Store::now_iso(),
                    expires_at
                ],
            )?;
        }

        Ok(ReviewIssued {
            review_id,
            token,
            confirmation_phrase,
            expires_at,
            action,
            reviewer,
            selected_count: selections.len(),
        })
    }

    /// Phase two: verify credentials, consume the review, and apply the
    /// action per selection. A successful confirm is one-shot — a repeat with
    /// the same arguments is `review_not_found`.
    pub async fn confirm(
        &self,
        review_id: &str,
        token: &str,
        confirmation_phrase: &str,
    ) -> Result<ConfirmOutcome> {
        let _section = self.guard.lock().await;

        let row: Option<(String, String, String, String, String, String)> = {
            let conn = self.store.conn();
            conn.query_row(
                "SELECT token, confirmation_phrase, action, reviewer, selections, expires_at \
                 FROM cleanup_reviews WHERE review_id = ?1",
                params![review_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )
            .optional()?
        };
        let Some((stored_token, stored_phrase, action, reviewer, selections_json, expires_at)) =
            row
        else {
            return Err(PalaceError::ReviewNotFound);
        };

        if expires_at <= Store::now_iso() {
            let conn = self.store.conn();
            conn.execute(
                "DELETE FROM cleanup_reviews WHERE review_id = ?1",
                params![review_id],
            )?;
            return Err(PalaceError::ReviewExpired);
        }
        if stored_token != token {
            return Err(PalaceError::ReviewNotFound);
        }
        if stored_phrase != confirmation_phrase {
            return Err(PalaceError::ConfirmationPhraseMismatch);
        }

        // Consume before applying: at-most-once even on partial failure.
        {
            let conn = self.store.conn();
            conn.execute(
                "DELETE FROM cleanup_reviews WHERE review_id = ?1",
                params![review_id],
            )?;
        }

        let selections: Vec<Value> =
            serde_json::from_str(&selections_json).unwrap_or_default();
        let ids: Vec<i64> = selections
            .iter()
            .filter_map(|s| s.get("memory_id").and_then(Value::as_i64))
            .collect();
        let latest = self
            .store
            .cleanup_candidates(None, None, ids.len().max(1), Some(&ids))?;

        let mut deleted = 0usize;
        let mut kept = 0usize;
        let mut skipped: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();

        for selection in &selections {
            let Some(memory_id) = selection.get("memory_id").and_then(Value::as_i64) else {
                continue;
            };
            let expected_hash = selection
                .get("state_hash")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let Some(current) = latest.iter().find(|c| c.memory_id == memory_id) else {
                skipped.push(json!({"memory_id": memory_id, "reason": "memory_missing"}));
                continue;
            };
            if current.state_hash != expected_hash {
                skipped.push(json!({"memory_id": memory_id, "reason": "stale_state"}));
                continue;
            }

            if action == "keep" {
                match self.store.bump_vitality_to_max(memory_id) {
                    Ok(()) => kept += 1,
                    Err(e) => {
                        errors.push(json!({"memory_id": memory_id, "error": e.to_string()}))
                    }
                }
                continue;
            }

            // delete: items with live paths are skipped, not forced.
            if !current.can_delete {
                skipped.push(json!({"memory_id": memory_id, "reason": "active_paths"}));
                continue;
            }
            match self
                .store
                .permanently_delete_memory(memory_id, true, Some(expected_hash))
            {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == "stale_state" => {
                    skipped.push(json!({"memory_id": memory_id, "reason": "stale_state"}));
                }
                Err(e) => errors.push(json!({"memory_id": memory_id, "error": e.to_string()})),
            }
        }

        Ok(ConfirmOutcome {
            status: if errors.is_empty() {
                "ok".into()
            } else {
                "partially_failed".into()
            },
            action,
            review_id: review_id.to_string(),
            reviewer,
            selected_count: selections.len(),
            deleted_count: deleted,
            kept_count: kept,
            skipped_count: skipped.len(),
            error_count: errors.len(),
            skipped,
            errors,
        })
    }
}

/// Single-flight wrapper around the daily decay tick.
pub struct DecayScheduler {
    store: Arc<Store>,
    state: Mutex<DecayState>,
    check_interval: std::time::Duration,
}

struct DecayState {
    last_check: Option<tokio::time::Instant>,
    last_result: Value,
}

impl DecayScheduler {
    pub fn new(store: Arc<Store>) -> Self {
        let check_interval = std::time::Duration::from_secs(
            store.config.governance.decay_check_interval_secs.max(10),
        );
        Self {
            store,
            state: Mutex::new(DecayState {
                last_check: None,
                last_result: json!({"applied": false, "reason": "not_started"}),
            }),
            check_interval,
        }
    }

    pub async fn run(&self, force: bool, reason: &str) -> Value {
        let mut state = self.state.lock().await;
        if !force {
            if let Some(last) = state.last_check {
                if last.elapsed() < self.check_interval {
                    return state.last_result.clone();
                }
            }
        }
        let result = match self.store.apply_vitality_decay(force, reason) {
            Ok(outcome) => serde_json::to_value(&outcome)
                .unwrap_or_else(|_| json!({"applied": false})),
            Err(e) => json!({"applied": false, "degraded": true, "reason": e.to_string()}),
        };
        state.last_check = Some(tokio::time::Instant::now());
        state.last_result = result.clone();
        result
    }

    pub async fn status(&self) -> Value {
        let state = self.state.lock().await;
        state.last_result.clone()
    }
}

/// Periodic scheduler for sleep-consolidation jobs. Keeps one pending job at
/// a time and retries early when the queue was full.
pub struct SleepScheduler {
    enabled: bool,
    interval: std::time::Duration,
    queue_full_retry: std::time::Duration,
    state: Mutex<SleepState>,
}

struct SleepState {
    last_check: Option<tokio::time::Instant>,
    retry_after: std::time::Duration,
    last_result: Value,
}

impl SleepScheduler {
    pub fn new(config: &crate::config::SleepConfig) -> Self {
        let interval = std::time::Duration::from_secs(config.interval_secs.max(60));
        Self {
            enabled: config.enabled,
            interval,
            queue_full_retry: std::time::Duration::from_secs(30),
            state: Mutex::new(SleepState {
                last_check: None,
                retry_after: interval,
                last_result: json!({"scheduled": false, "reason": "not_started"}),
            }),
        }
    }

    pub async fn schedule(&self, worker: &IndexWorker, force: bool, reason: &str) -> Value {
        let mut state = self.state.lock().await;
        if !self.enabled {
            state.last_result = json!({
                "scheduled": false,
                "reason": "sleep_consolidation_disabled",
            });
            return state.last_result.clone();
        }
        if !force {
            if let Some(last) = state.last_check {
                if last.elapsed() < state.retry_after {
                    return state.last_result.clone();
                }
            }
        }

        let outcome = worker.enqueue_sleep_consolidation(reason);
        state.last_check = Some(tokio::time::Instant::now());
        match outcome {
            Ok(enqueue) => {
                let scheduled = enqueue.queued || enqueue.deduped;
                state.retry_after = if !scheduled
                    && enqueue.reason.as_deref() == Some("queue_full")
                {
                    self.queue_full_retry.min(self.interval)
                } else {
                    self.interval
                };
                state.last_result = json!({
                    "scheduled": scheduled,
                    "job_id": enqueue.job_id,
                    "deduped": enqueue.deduped,
                    "dropped": enqueue.dropped,
                    "reason": reason,
                });
            }
            Err(e) => {
                state.retry_after = self.interval;
                state.last_result = json!({"scheduled": false, "reason": e.to_string()});
            }
        }
        state.last_result.clone()
    }

    pub async fn status(&self) -> Value {
        let state = self.state.lock().await;
        json!({
            "enabled": self.enabled,
            "interval_secs": self.interval.as_secs(),
            "last": state.last_result.clone(),
        })
    }
}

/// The shared periodic loop driving decay ticks and sleep scheduling.
pub struct GovernanceLoop {
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GovernanceLoop {
    pub fn spawn(
        decay: Arc<DecayScheduler>,
        sleep: Arc<SleepScheduler>,
        worker: Arc<IndexWorker>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                decay.run(false, "governance_tick").await;
                sleep.schedule(&worker, false, "governance_tick").await;
            }
        });
        Self {
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().expect("governance handle").take() {
            handle.abort();
        }
    }
}
