//! Intent routing through the search surface.

mod helpers;

use helpers::{seed_memory, test_core};
use palace::retrieval::{search::SearchFilters, SearchRequest};

fn request(query: &str) -> SearchRequest {
    SearchRequest {
        query: query.into(),
        mode: Some("hybrid".into()),
        max_results: Some(10),
        candidate_multiplier: Some(4),
        include_session: Some(false),
        filters: SearchFilters::default(),
    }
}

#[tokio::test]
async fn temporal_query_routes_and_windows() {
    let core = test_core();
    seed_memory(&core, "core://", "standup", "weekly meetings sync notes").await;
    seed_memory(&core, "core://", "archive", "meetings archive from the before times").await;

    // Push the archive far outside any computed time window.
    let old = (chrono::Utc::now() - chrono::Duration::days(400)).to_rfc3339();
    core.store
        .conn()
        .execute(
            "UPDATE memories SET updated_at = ?1, created_at = ?1 \
             WHERE id = (SELECT memory_id FROM paths WHERE path = 'archive')",
            rusqlite::params![old],
        )
        .unwrap();

    let response = core.search_memory(&request("meetings last week")).await.unwrap();
    assert_eq!(response["ok"], true);
    assert_eq!(response["intent"], "temporal");
    assert_eq!(response["strategy_template"], "temporal_time_filtered");

    let uris: Vec<&str> = response["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert!(uris.contains(&"core://standup"), "recent hit missing: {uris:?}");
    assert!(!uris.contains(&"core://archive"), "stale hit leaked: {uris:?}");
}

#[tokio::test]
async fn causal_and_exploratory_queries_route() {
    let core = test_core();
    seed_memory(&core, "core://", "incident", "deploy failed because of bad config").await;

    let causal = core
        .search_memory(&request("why did the deploy fail"))
        .await
        .unwrap();
    assert_eq!(causal["intent"], "causal");
    assert_eq!(causal["strategy_template"], "causal_wide_pool");

    let exploratory = core
        .search_memory(&request("list options and alternatives for deploy"))
        .await
        .unwrap();
    assert_eq!(exploratory["intent"], "exploratory");
    assert_eq!(exploratory["strategy_template"], "exploratory_high_recall");
}

#[tokio::test]
async fn plain_query_defaults_to_factual() {
    let core = test_core();
    seed_memory(&core, "core://", "schema", "database schema documentation").await;

    let response = core.search_memory(&request("database schema")).await.unwrap();
    assert_eq!(response["intent"], "factual");
    assert_eq!(response["strategy_template"], "factual_high_precision");
}

#[tokio::test]
async fn tied_weak_signals_route_to_unknown() {
    let core = test_core();
    seed_memory(&core, "core://", "doc", "some reference content").await;

    let response = core.search_memory(&request("why yesterday")).await.unwrap();
    assert_eq!(response["intent"], "unknown");
    assert_eq!(response["strategy_template"], "default");
}
