//! HTTP control plane: maintenance, review, and browse endpoints.
//!
//! Every write path sits behind the API-key middleware; reads of the browse
//! tree (and the health probe) are open. Full-queue enqueues answer 503 with
//! `index_job_enqueue_failed` / `queue_full` so operators can distinguish
//! backpressure from hard failures.

pub mod auth;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::core::PalaceCore;
use crate::errors::PalaceError;
use crate::governance::CleanupSelection;

type CoreState = State<Arc<PalaceCore>>;
type ApiResult = Result<Json<Value>, PalaceError>;

/// Build the full control-plane router.
pub fn control_plane(core: Arc<PalaceCore>) -> Router {
    let auth_state = Arc::new(core.config.auth.clone());

    let maintenance = Router::new()
        .route("/vitality/decay", post(trigger_decay))
        .route("/vitality/candidates/query", post(query_candidates))
        .route("/vitality/cleanup/prepare", post(cleanup_prepare))
        .route("/vitality/cleanup/confirm", post(cleanup_confirm))
        .route("/index/worker", get(worker_status))
        .route("/index/job/{job_id}", get(get_job))
        .route("/index/job/{job_id}/cancel", post(cancel_job))
        .route("/index/job/{job_id}/retry", post(retry_job))
        .route("/index/rebuild", post(rebuild_index))
        .route("/index/reindex/{memory_id}", post(reindex_memory))
        .route("/index/sleep-consolidation", post(sleep_consolidation))
        .route("/orphans", get(list_orphans))
        .route("/orphans/{memory_id}", delete(delete_orphan))
        .route("/snapshots/{session_id}", get(list_snapshots))
        .route("/snapshots/{session_id}/diff", get(diff_snapshot))
        .route("/snapshots/{session_id}/rollback", post(rollback_snapshot))
        .route("/snapshots/{session_id}/approve", post(approve_snapshot))
        .route("/snapshots/{session_id}/clear", post(clear_snapshots))
        .route("/observability/summary", get(observability_summary))
        .layer(middleware::from_fn_with_state(
            auth_state,
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/browse/tree", get(browse_tree))
        .nest("/maintenance", maintenance)
        .with_state(core)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

// ── Browse (unauthenticated reads) ──────────────────────────────────────────

#[derive(Deserialize)]
struct BrowseQuery {
    domain: Option<String>,
}

async fn browse_tree(
    State(core): CoreState,
    Query(query): Query<BrowseQuery>,
) -> ApiResult {
    let paths = core.store.list_all_paths(query.domain.as_deref())?;
    let entries: Vec<Value> = paths
        .iter()
        .map(|p| {
            json!({
                "uri": p.uri(),
                "domain": p.domain,
                "path": p.path,
                "memory_id": p.memory_id,
                "priority": p.priority,
                "disclosure": p.disclosure,
            })
        })
        .collect();
    Ok(Json(json!({"ok": true, "count": entries.len(), "entries": entries})))
}

// ── Vitality / cleanup ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DecayRequest {
    #[serde(default)]
    force: bool,
    reason: Option<String>,
}

async fn trigger_decay(
    State(core): CoreState,
    Json(request): Json<DecayRequest>,
) -> ApiResult {
    let result = core
        .decay
        .run(request.force, request.reason.as_deref().unwrap_or("api"))
        .await;
    Ok(Json(json!({"ok": true, "result": result})))
}

#[derive(Deserialize)]
struct CandidatesRequest {
    threshold: Option<f64>,
    inactive_days: Option<f64>,
    #[serde(default = "default_candidate_limit")]
    limit: usize,
}

fn default_candidate_limit() -> usize {
    50
}

async fn query_candidates(
    State(core): CoreState,
    Json(request): Json<CandidatesRequest>,
) -> ApiResult {
    // Decay before listing so scores reflect today's tick.
    core.decay.run(false, "vitality_candidates").await;
    let items = core.store.cleanup_candidates(
        request.threshold,
        request.inactive_days,
        request.limit,
        None,
    )?;
    Ok(Json(json!({
        "ok": true,
        "count": items.len(),
        "items": items,
        "threshold": request.threshold.unwrap_or(core.config.governance.cleanup_threshold),
        "inactive_days": request.inactive_days.unwrap_or(core.config.governance.cleanup_inactive_days),
    })))
}

#[derive(Deserialize)]
struct PrepareSelection {
    memory_id: i64,
    state_hash: String,
}

#[derive(Deserialize)]
struct PrepareRequest {
    #[serde(default = "default_action")]
    action: String,
    reviewer: Option<String>,
    selections: Vec<PrepareSelection>,
    ttl_seconds: Option<u64>,
}

fn default_action() -> String {
    "delete".to_string()
}

async fn cleanup_prepare(
    State(core): CoreState,
    Json(request): Json<PrepareRequest>,
) -> ApiResult {
    let selections: Vec<CleanupSelection> = request
        .selections
        .iter()
        .map(|s| CleanupSelection {
            memory_id: s.memory_id,
            state_hash: s.state_hash.clone(),
        })
        .collect();
    let review = core
        .reviews
        .prepare(
            &request.action,
            request.reviewer.as_deref(),
            &selections,
            request.ttl_seconds,
        )
        .await?;
    Ok(Json(json!({
        "ok": true,
        "status": "pending_confirmation",
        "review": review,
    })))
}

#[derive(Deserialize)]
struct ConfirmRequest {
    review_id: String,
    token: String,
    confirmation_phrase: String,
}

async fn cleanup_confirm(
    State(core): CoreState,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult {
    let outcome = core
        .reviews
        .confirm(
            &request.review_id,
            &request.token,
            &request.confirmation_phrase,
        )
        .await?;
    Ok(Json(serde_json::to_value(&outcome).map_err(|e| {
        PalaceError::Internal(anyhow::anyhow!(e))
    })?))
}

// ── Index jobs ──────────────────────────────────────────────────────────────

fn enqueue_response(outcome: crate::worker::EnqueueOutcome) -> Response {
    if outcome.dropped {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "index_job_enqueue_failed",
                "reason": "queue_full",
                "job_id": outcome.job_id,
            })),
        )
            .into_response();
    }
    Json(json!({
        "ok": true,
        "job_id": outcome.job_id,
        "queued": outcome.queued,
        "deduped": outcome.deduped,
        "dropped": outcome.dropped,
    }))
    .into_response()
}

async fn worker_status(State(core): CoreState) -> ApiResult {
    Ok(Json(serde_json::to_value(core.worker.status()).map_err(
        |e| PalaceError::Internal(anyhow::anyhow!(e)),
    )?))
}

async fn get_job(State(core): CoreState, Path(job_id): Path<String>) -> ApiResult {
    let job = core.worker.get_job(&job_id)?;
    Ok(Json(json!({"ok": true, "job": job})))
}

#[derive(Deserialize, Default)]
struct JobActionRequest {
    reason: Option<String>,
}

async fn cancel_job(
    State(core): CoreState,
    Path(job_id): Path<String>,
    request: Option<Json<JobActionRequest>>,
) -> ApiResult {
    let reason = request
        .as_ref()
        .and_then(|r| r.reason.clone())
        .unwrap_or_else(|| "api_cancel".to_string());
    let job = core.worker.cancel_job(&job_id, &reason)?;
    Ok(Json(json!({"ok": true, "job": job})))
}

/// Unified retry endpoint: re-enqueues the original task parameters and
/// returns the NEW job id.
async fn retry_job(
    State(core): CoreState,
    Path(job_id): Path<String>,
    request: Option<Json<JobActionRequest>>,
) -> Result<Response, PalaceError> {
    let reason = request
        .as_ref()
        .and_then(|r| r.reason.clone())
        .unwrap_or_default();
    let outcome = core.worker.retry_job(&job_id, &reason)?;
    if outcome.dropped {
        return Ok(enqueue_response(outcome));
    }
    Ok(Json(json!({
        "ok": true,
        "retry_of_job_id": job_id,
        "job_id": outcome.job_id,
        "queued": outcome.queued,
        "deduped": outcome.deduped,
        "dropped": outcome.dropped,
    }))
    .into_response())
}

#[derive(Deserialize, Default)]
struct EnqueueQuery {
    reason: Option<String>,
    #[serde(default)]
    wait: bool,
    timeout_seconds: Option<u64>,
}

async fn rebuild_index(
    State(core): CoreState,
    Query(query): Query<EnqueueQuery>,
) -> Result<Response, PalaceError> {
    enqueue_and_wait(&core, None, false, query).await
}

async fn reindex_memory(
    State(core): CoreState,
    Path(memory_id): Path<i64>,
    Query(query): Query<EnqueueQuery>,
) -> Result<Response, PalaceError> {
    enqueue_and_wait(&core, Some(memory_id), false, query).await
}

async fn sleep_consolidation(
    State(core): CoreState,
    Query(query): Query<EnqueueQuery>,
) -> Result<Response, PalaceError> {
    enqueue_and_wait(&core, None, true, query).await
}

async fn enqueue_and_wait(
    core: &PalaceCore,
    memory_id: Option<i64>,
    sleep: bool,
    query: EnqueueQuery,
) -> Result<Response, PalaceError> {
    let reason = query.reason.as_deref().unwrap_or("api");
    let outcome = if sleep {
        core.worker.enqueue_sleep_consolidation(reason)?
    } else if let Some(memory_id) = memory_id {
        core.worker.enqueue_reindex_memory(memory_id, reason)?
    } else {
        core.worker.enqueue_rebuild(reason)?
    };
    if outcome.dropped {
        return Ok(enqueue_response(outcome));
    }

    let mut payload = json!({
        "ok": true,
        "job_id": outcome.job_id,
        "queued": outcome.queued,
        "deduped": outcome.deduped,
        "dropped": outcome.dropped,
        "reason": reason,
    });
    if query.wait {
        let (job, timed_out) = core
            .worker
            .wait_for_job(
                &outcome.job_id,
                std::time::Duration::from_secs(query.timeout_seconds.unwrap_or(30).clamp(1, 600)),
            )
            .await?;
        payload["wait_result"] = if timed_out {
            json!({"ok": false, "reason": "wait_timeout", "job": job})
        } else {
            json!({"ok": true, "job": job})
        };
    }
    Ok(Json(payload).into_response())
}

// ── Orphans ─────────────────────────────────────────────────────────────────

async fn list_orphans(State(core): CoreState) -> ApiResult {
    let orphans = core.store.list_orphans()?;
    Ok(Json(json!({"ok": true, "count": orphans.len(), "orphans": orphans})))
}

async fn delete_orphan(State(core): CoreState, Path(memory_id): Path<i64>) -> ApiResult {
    core.store.permanently_delete_memory(memory_id, true, None)?;
    Ok(Json(json!({"ok": true, "deleted": true, "memory_id": memory_id})))
}

// ── Snapshot review ─────────────────────────────────────────────────────────

async fn list_snapshots(State(core): CoreState, Path(session_id): Path<String>) -> ApiResult {
    let snapshots = core.ledger.list(&session_id)?;
    Ok(Json(json!({
        "ok": true,
        "session_id": session_id,
        "count": snapshots.len(),
        "snapshots": snapshots,
    })))
}

#[derive(Deserialize)]
struct ResourceQuery {
    resource_id: String,
}

async fn diff_snapshot(
    State(core): CoreState,
    Path(session_id): Path<String>,
    Query(query): Query<ResourceQuery>,
) -> ApiResult {
    let diff = core.ledger.diff(&session_id, &query.resource_id)?;
    Ok(Json(serde_json::to_value(&diff).map_err(|e| {
        PalaceError::Internal(anyhow::anyhow!(e))
    })?))
}

#[derive(Deserialize)]
struct ResourceBody {
    resource_id: String,
}

async fn rollback_snapshot(
    State(core): CoreState,
    Path(session_id): Path<String>,
    Json(body): Json<ResourceBody>,
) -> ApiResult {
    // Rollback is a write: it runs under the Write Lane like any other.
    let lane_key = core
        .ledger
        .rollback_lane_key(&session_id, &body.resource_id)?;
    let outcome = core
        .lane
        .run(&lane_key, || async {
            core.ledger.rollback(&session_id, &body.resource_id)
        })
        .await?;
    Ok(Json(json!({
        "ok": true,
        "rolled_back": true,
        "outcome": serde_json::to_value(&outcome)
            .map_err(|e| PalaceError::Internal(anyhow::anyhow!(e)))?,
    })))
}

async fn approve_snapshot(
    State(core): CoreState,
    Path(session_id): Path<String>,
    Json(body): Json<ResourceBody>,
) -> ApiResult {
    core.ledger.approve(&session_id, &body.resource_id)?;
    Ok(Json(json!({"ok": true, "approved": true})))
}

async fn clear_snapshots(State(core): CoreState, Path(session_id): Path<String>) -> ApiResult {
    let removed = core.ledger.clear(&session_id)?;
    Ok(Json(json!({"ok": true, "cleared": removed})))
}

// ── Observability ───────────────────────────────────────────────────────────

async fn observability_summary(State(core): CoreState) -> ApiResult {
    let status = core.index_status().await?;
    let pending_reviews = core.reviews.pending_count().await?;
    Ok(Json(json!({
        "ok": true,
        "index": status,
        "pending_reviews": pending_reviews,
        "sleep_consolidation": core.sleep.status().await,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PalaceConfig;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_core(api_key: Option<&str>) -> Arc<PalaceCore> {
        let mut config = PalaceConfig::default();
        config.auth.api_key = api_key.map(String::from);
        let config = Arc::new(config);
        let conn = crate::db::open_memory_database(config.embedding.dim).unwrap();
        let store = Arc::new(Store::new(conn, config));
        PalaceCore::new(store)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_browse_are_open() {
        let core = test_core(Some("secret"));
        core.create_memory("core://", "body", 0, Some("doc"), None)
            .await
            .unwrap();
        let app = control_plane(core);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/browse/tree").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["count"], 1);
        assert_eq!(payload["entries"][0]["uri"], "core://doc");
    }

    #[tokio::test]
    async fn maintenance_requires_api_key() {
        let core = test_core(Some("secret"));
        let app = control_plane(core);

        let response = app
            .clone()
            .oneshot(
                Request::get("/maintenance/index/worker")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "invalid_or_missing_api_key");

        let response = app
            .clone()
            .oneshot(
                Request::get("/maintenance/index/worker")
                    .header(auth::API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/maintenance/index/worker")
                    .header("Authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unconfigured_key_reports_reason() {
        let core = test_core(None);
        let app = control_plane(core);
        let response = app
            .oneshot(
                Request::get("/maintenance/index/worker")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "api_key_not_configured");
    }

    #[tokio::test]
    async fn cleanup_wire_contract_round_trip() {
        let core = test_core(Some("secret"));
        // Build one deletable orphan.
        core.create_memory("core://", "orphan body", 0, Some("doc"), None)
            .await
            .unwrap();
        core.update_memory("core://doc", None, None, Some(" v2"), None, None)
            .await
            .unwrap();
        let orphan_id = core.store.list_orphans().unwrap()[0].memory_id;
        let candidate = core
            .store
            .cleanup_candidates(None, None, 10, Some(&[orphan_id]))
            .unwrap();
        let state_hash = candidate[0].state_hash.clone();

        let app = control_plane(Arc::clone(&core));
        let prepare_body = json!({
            "action": "delete",
            "reviewer": "operator",
            "selections": [{"memory_id": orphan_id, "state_hash": state_hash}],
        });
        let response = app
            .clone()
            .oneshot(
                Request::post("/maintenance/vitality/cleanup/prepare")
                    .header(auth::API_KEY_HEADER, "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(prepare_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let prepared = body_json(response).await;
        let review = &prepared["review"];
        assert!(review["review_id"].as_str().unwrap().starts_with("cleanup-"));
        assert!(!review["token"].as_str().unwrap().is_empty());
        assert!(!review["confirmation_phrase"].as_str().unwrap().is_empty());
        assert!(!review["expires_at"].as_str().unwrap().is_empty());

        let confirm_body = json!({
            "review_id": review["review_id"],
            "token": review["token"],
            "confirmation_phrase": review["confirmation_phrase"],
        });
        let response = app
            .oneshot(
                Request::post("/maintenance/vitality/cleanup/confirm")
                    .header(auth::API_KEY_HEADER, "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(confirm_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let confirmed = body_json(response).await;
        assert_eq!(confirmed["status"], "ok");
        assert_eq!(confirmed["deleted_count"], 1);
        assert_eq!(confirmed["error_count"], 0);
    }

    #[tokio::test]
    async fn job_endpoints_round_trip() {
        let core = test_core(Some("secret"));
        core.create_memory("core://", "index me", 0, Some("doc"), None)
            .await
            .unwrap();
        let app = control_plane(Arc::clone(&core));

        let response = app
            .clone()
            .oneshot(
                Request::post("/maintenance/index/rebuild?wait=true&timeout_seconds=10")
                    .header(auth::API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        let job_id = payload["job_id"].as_str().unwrap().to_string();
        assert_eq!(payload["wait_result"]["job"]["state"], "succeeded");

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/maintenance/index/job/{job_id}"))
                    .header(auth::API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A succeeded job is not retryable.
        let response = app
            .oneshot(
                Request::post(format!("/maintenance/index/job/{job_id}/retry"))
                    .header(auth::API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn snapshot_endpoints_round_trip() {
        let core = test_core(Some("secret"));
        core.create_memory("core://", "A", 0, Some("rules"), None)
            .await
            .unwrap();
        core.update_memory("core://rules", Some("A"), Some("B"), None, None, None)
            .await
            .unwrap();
        let session_id = core.session_id().to_string();
        let app = control_plane(Arc::clone(&core));

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/maintenance/snapshots/{session_id}"))
                    .header(auth::API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert!(listed["count"].as_u64().unwrap() >= 1);
        let resource_id = listed["snapshots"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["operation_type"] == "modify_content")
            .unwrap()["resource_id"]
            .as_str()
            .unwrap()
            .to_string();

        let rollback_body = json!({"resource_id": resource_id});
        let response = app
            .oneshot(
                Request::post(format!("/maintenance/snapshots/{session_id}/rollback"))
                    .header(auth::API_KEY_HEADER, "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(rollback_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let resolved = core.store.get_memory_by_path("core", "rules").unwrap().unwrap();
        assert_eq!(resolved.memory.content, "A");
    }
}
