//! Snapshot ledger round-trips through the tool write path.

mod helpers;

use helpers::{seed_memory, test_core};

#[tokio::test]
async fn update_rollback_restores_pre_state_byte_for_byte() {
    let core = test_core();
    seed_memory(&core, "core://", "rules", "A").await;

    core.update_memory("core://rules", Some("A"), Some("B"), None, None, None)
        .await
        .unwrap();

    let session = core.session_id().to_string();
    let pending = core.ledger.list(&session).unwrap();
    // The seed create and the content update each hold one snapshot.
    let content_snapshot = pending
        .iter()
        .find(|s| s.operation_type == "modify_content")
        .expect("content snapshot pending");
    let resource_id = content_snapshot.resource_id.clone();

    // Rollback is a write: route it through the lane like the HTTP plane does.
    let lane_key = core.ledger.rollback_lane_key(&session, &resource_id).unwrap();
    let outcome = core
        .lane
        .run(&lane_key, || async { core.ledger.rollback(&session, &resource_id) })
        .await
        .unwrap();
    assert_eq!(outcome.restored_uri.as_deref(), Some("core://rules"));

    let resolved = core.store.get_memory_by_path("core", "rules").unwrap().unwrap();
    assert_eq!(resolved.memory.content, "A");

    // The snapshot is consumed: diff afterwards reports it missing.
    let err = core.ledger.diff(&session, &resource_id).unwrap_err();
    assert_eq!(err.kind(), "snapshot_not_found");
}

#[tokio::test]
async fn delete_rollback_restores_the_path() {
    let core = test_core();
    seed_memory(&core, "core://", "victim", "precious content").await;
    core.update_memory("core://victim", None, None, None, Some(4), Some("guarded"))
        .await
        .unwrap();
    let session = core.session_id().to_string();

    // Approve the create-time snapshot; otherwise the later delete would
    // cancel against it and leave nothing to roll back.
    core.ledger.approve(&session, "core://victim").unwrap();

    core.delete_memory("core://victim").await.unwrap();
    assert!(core.store.get_memory_by_path("core", "victim").unwrap().is_none());

    core.ledger.rollback(&session, "core://victim").unwrap();
    let resolved = core.store.get_memory_by_path("core", "victim").unwrap().unwrap();
    assert_eq!(resolved.memory.content, "precious content");
    assert_eq!(resolved.priority, 4);
    assert_eq!(resolved.disclosure.as_deref(), Some("guarded"));
    assert!(!resolved.memory.deprecated);
}

#[tokio::test]
async fn create_then_delete_leaves_no_review_residue() {
    let core = test_core();
    seed_memory(&core, "core://", "ephemeral", "temporary note").await;
    core.delete_memory("core://ephemeral").await.unwrap();

    let session = core.session_id().to_string();
    assert!(core.ledger.list(&session).unwrap().is_empty());
}

#[tokio::test]
async fn repeated_updates_roll_back_to_session_origin() {
    let core = test_core();
    seed_memory(&core, "core://", "doc", "v1").await;

    core.update_memory("core://doc", Some("v1"), Some("v2"), None, None, None)
        .await
        .unwrap();
    core.update_memory("core://doc", Some("v2"), Some("v3"), None, None, None)
        .await
        .unwrap();

    let session = core.session_id().to_string();
    let pending = core.ledger.list(&session).unwrap();
    // One content snapshot despite two updates: first capture wins.
    let content_snapshots: Vec<_> = pending
        .iter()
        .filter(|s| s.operation_type == "modify_content")
        .collect();
    assert_eq!(content_snapshots.len(), 1);

    core.ledger
        .rollback(&session, &content_snapshots[0].resource_id)
        .unwrap();
    let resolved = core.store.get_memory_by_path("core", "doc").unwrap().unwrap();
    assert_eq!(resolved.memory.content, "v1");
}

#[tokio::test]
async fn approve_and_clear_manage_the_session_set() {
    let core = test_core();
    seed_memory(&core, "core://", "a", "content a").await;
    seed_memory(&core, "core://", "b", "content b").await;
    let session = core.session_id().to_string();

    let pending = core.ledger.list(&session).unwrap();
    assert_eq!(pending.len(), 2);

    core.ledger.approve(&session, &pending[0].resource_id).unwrap();
    assert_eq!(core.ledger.list(&session).unwrap().len(), 1);

    assert_eq!(core.ledger.clear(&session).unwrap(), 1);
    assert!(core.ledger.list(&session).unwrap().is_empty());
}
