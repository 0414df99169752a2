//! Cross-cutting invariants and boundary behaviors through the tool surface.

mod helpers;

use helpers::{seed_memory, test_core};
use palace::retrieval::{search::SearchFilters, SearchRequest};

#[tokio::test]
async fn invalid_title_is_rejected() {
    let core = test_core();
    for bad in ["Has Space", "Ümlaut", "semi;colon", "slash/inside", "UPPER"] {
        let err = core
            .create_memory("core://", "content", 0, Some(bad), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument", "title '{bad}' should fail");
    }
}

#[tokio::test]
async fn negative_priority_rejected_zero_accepted() {
    let core = test_core();
    let err = core
        .create_memory("core://", "content", -1, Some("doc"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("non-negative"));

    let ok = core
        .create_memory("core://", "content", 0, Some("doc"), None)
        .await
        .unwrap();
    assert_eq!(ok["created"], true);
}

#[tokio::test]
async fn search_bounds_are_exact() {
    let core = test_core();
    seed_memory(&core, "core://", "doc", "bounded search content").await;

    let mut request = SearchRequest {
        query: "bounded".into(),
        mode: Some("keyword".into()),
        max_results: Some(0),
        candidate_multiplier: Some(4),
        include_session: Some(false),
        filters: SearchFilters::default(),
    };
    assert!(core.search_memory(&request).await.is_err());

    request.max_results = Some(51);
    assert!(core.search_memory(&request).await.is_err());

    request.max_results = Some(50);
    let ok = core.search_memory(&request).await.unwrap();
    assert_eq!(ok["ok"], true);
    assert_eq!(ok["max_results"], 50);
}

#[tokio::test]
async fn delete_keeps_memory_reachable_via_aliases() {
    let core = test_core();
    seed_memory(&core, "core://", "origin", "shared body of knowledge").await;
    core.add_alias("notes://mirror", "core://origin", 0, None)
        .await
        .unwrap();

    let deleted = core.delete_memory("core://origin").await.unwrap();
    assert_eq!(deleted["surviving_paths"], serde_json::json!(["notes://mirror"]));
    assert_eq!(deleted["memory_deprecated"], false);

    // Still readable through the surviving alias.
    let read = core.read_memory("notes://mirror", None, None, None).await.unwrap();
    assert!(read["content"]
        .as_str()
        .unwrap()
        .contains("shared body of knowledge"));

    // Deleting the last path deprecates.
    let second = core.delete_memory("notes://mirror").await.unwrap();
    assert_eq!(second["memory_deprecated"], true);
    let memory_id = second["memory_id"].as_i64().unwrap();
    assert!(core.store.get_memory_by_id(memory_id).unwrap().unwrap().deprecated);
}

#[tokio::test]
async fn vitality_stays_within_bounds_under_access() {
    let core = test_core();
    let uri = seed_memory(&core, "core://", "hot", "frequently read memory").await;

    for _ in 0..200 {
        core.read_memory(&uri, None, None, None).await.unwrap();
    }
    let resolved = core.store.get_memory_by_path("core", "hot").unwrap().unwrap();
    assert!(resolved.memory.vitality_score <= core.config.governance.vitality_max + 1e-9);
    assert!(resolved.memory.vitality_score >= core.config.governance.vitality_floor);
    assert_eq!(resolved.memory.access_count, 200);
}

#[tokio::test]
async fn writes_to_same_record_serialize_in_order() {
    let core = test_core();
    seed_memory(&core, "core://", "log", "start").await;

    // Appends through the lane; each new version chains to the previous.
    for i in 0..5 {
        core.update_memory("core://log", None, None, Some(&format!(" {i}")), None, None)
            .await
            .unwrap();
    }
    let resolved = core.store.get_memory_by_path("core", "log").unwrap().unwrap();
    assert_eq!(resolved.memory.content, "start 0 1 2 3 4");
}

#[tokio::test]
async fn reindex_twice_is_idempotent() {
    let core = test_core();
    seed_memory(&core, "core://", "doc", "idempotent reindex target text").await;
    let resolved = core.store.get_memory_by_path("core", "doc").unwrap().unwrap();

    let first = core
        .rebuild_index(Some(resolved.memory.id), "once", true, 10, false)
        .await
        .unwrap();
    let count_first = core.store.indexed_chunk_count(resolved.memory.id).unwrap();

    let second = core
        .rebuild_index(Some(resolved.memory.id), "twice", true, 10, false)
        .await
        .unwrap();
    let count_second = core.store.indexed_chunk_count(resolved.memory.id).unwrap();

    assert_eq!(first["wait_result"]["job"]["state"], "succeeded");
    assert_eq!(second["wait_result"]["job"]["state"], "succeeded");
    assert_eq!(count_first, count_second);
}

#[tokio::test]
async fn content_hash_tracks_content() {
    let core = test_core();
    seed_memory(&core, "core://", "doc", "original").await;
    let before = core
        .store
        .get_memory_by_path("core", "doc")
        .unwrap()
        .unwrap()
        .memory
        .content_hash;

    core.update_memory("core://doc", Some("original"), Some("changed"), None, None, None)
        .await
        .unwrap();
    let after = core
        .store
        .get_memory_by_path("core", "doc")
        .unwrap()
        .unwrap()
        .memory
        .content_hash;
    assert_ne!(before, after);
}

#[tokio::test]
async fn unknown_domain_and_missing_address_error() {
    let core = test_core();
    let err = core.read_memory("bogus://x", None, None, None).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_domain");

    let err = core
        .read_memory("core://missing", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "address_not_found");
}
