//! End-to-end write-guard behavior through the tool surface.

mod helpers;

use helpers::{seed_memory, test_core};

#[tokio::test]
async fn duplicate_create_returns_noop_with_target() {
    let core = test_core();
    seed_memory(&core, "core://", "agent", "Agent root memory").await;
    seed_memory(&core, "core://agent", "style", "Prefer concise code").await;

    let second = core
        .create_memory("core://agent", "Prefer concise code", 0, Some("style2"), None)
        .await
        .unwrap();

    assert_eq!(second["ok"], true);
    assert_eq!(second["created"], false);
    assert_eq!(second["guard"]["action"], "NOOP");
    assert_eq!(second["guard"]["target_uri"], "core://agent/style");
    let method = second["guard"]["method"].as_str().unwrap();
    assert!(
        method == "embedding" || method == "keyword",
        "unexpected method {method}"
    );

    // The blocked create left no new path behind.
    assert!(core.store.get_memory_by_path("core", "agent/style2").unwrap().is_none());
}

#[tokio::test]
async fn distinct_content_passes_the_guard() {
    let core = test_core();
    seed_memory(&core, "core://", "style", "Prefer concise code").await;

    let second = core
        .create_memory(
            "core://",
            "Ship release notes every Friday afternoon",
            0,
            Some("cadence"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(second["created"], true);
    assert_eq!(second["guard"]["action"], "ADD");
}

#[tokio::test]
async fn guard_failure_degrades_to_fallback_add() {
    // Remote embedding pointing nowhere, no vector index, no keyword index
    // content: the guard cannot classify and must fall back to ADD.
    let core = helpers::core_with(|config| {
        config.embedding.backend = "api".into();
        config.embedding.api_base = "http://127.0.0.1:1".into();
        config.embedding.model = "embed".into();
        config.embedding.max_retries = 0;
        config.embedding.timeout_secs = 1.0;
    });

    let result = core
        .create_memory("core://", "first write with broken embedding", 0, Some("doc"), None)
        .await
        .unwrap();
    assert_eq!(result["created"], true);
    assert_eq!(result["guard"]["action"], "ADD");
    let reasons = result["guard"]["degrade_reasons"].as_array().unwrap();
    assert!(
        reasons.iter().any(|r| r == "embedding_request_failed"),
        "expected embedding_request_failed in {reasons:?}"
    );
}

#[tokio::test]
async fn meta_only_update_is_bypass() {
    let core = test_core();
    seed_memory(&core, "core://", "doc", "stable content").await;

    let updated = core
        .update_memory("core://doc", None, None, None, Some(7), None)
        .await
        .unwrap();
    assert_eq!(updated["updated"], true);
    assert_eq!(updated["guard"]["action"], "BYPASS");
    assert_eq!(updated["guard"]["method"], "bypass");
}
