//! Two-phase cleanup review: prepare, confirm, one-shot consumption.

mod helpers;

use helpers::{seed_memory, test_core};
use palace::governance::CleanupSelection;

/// Make `count` deletable orphans and return their selections.
async fn orphan_selections(
    core: &palace::core::PalaceCore,
    count: usize,
) -> Vec<CleanupSelection> {
    for i in 0..count {
        let title = format!("victim{i}");
        // Distinct token sets per victim keep the write guard out of the way.
        seed_memory(core, "core://", &title, &format!("topic{i}a topic{i}b topic{i}c")).await;
        let updated = core
            .update_memory(
                &format!("core://{title}"),
                None,
                None,
                Some(&format!(" tail{i}")),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated["updated"], true, "guard blocked fixture: {updated}");
    }
    let orphans = core.store.list_orphans().unwrap();
    assert_eq!(orphans.len(), count);

    let ids: Vec<i64> = orphans.iter().map(|o| o.memory_id).collect();
    core.store
        .cleanup_candidates(None, None, count.max(1), Some(&ids))
        .unwrap()
        .into_iter()
        .map(|c| {
            assert!(c.can_delete);
            CleanupSelection {
                memory_id: c.memory_id,
                state_hash: c.state_hash,
            }
        })
        .collect()
}

#[tokio::test]
async fn two_phase_delete_with_wrong_phrase_then_success() {
    let core = test_core();
    let selections = orphan_selections(&core, 2).await;

    let review = core
        .reviews
        .prepare("delete", Some("operator"), &selections, None)
        .await
        .unwrap();
    assert_eq!(review.action, "delete");
    assert_eq!(review.selected_count, 2);

    // Wrong phrase: rejected, review stays pending.
    let err = core
        .reviews
        .confirm(&review.review_id, &review.token, "X")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "confirmation_phrase_mismatch");

    // Correct phrase: both selections delete.
    let outcome = core
        .reviews
        .confirm(&review.review_id, &review.token, &review.confirmation_phrase)
        .await
        .unwrap();
    assert_eq!(outcome.status, "ok");
    assert_eq!(outcome.deleted_count, 2);
    assert_eq!(outcome.skipped_count, 0);
    assert_eq!(outcome.error_count, 0);
    for selection in &selections {
        assert!(core
            .store
            .get_memory_by_id(selection.memory_id)
            .unwrap()
            .is_none());
    }

    // One-shot: repeating the same confirm is review_not_found.
    let err = core
        .reviews
        .confirm(&review.review_id, &review.token, &review.confirmation_phrase)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "review_not_found");
}

#[tokio::test]
async fn keep_action_pins_vitality() {
    let core = test_core();
    let selections = orphan_selections(&core, 1).await;

    let review = core
        .reviews
        .prepare("keep", None, &selections, None)
        .await
        .unwrap();
    let outcome = core
        .reviews
        .confirm(&review.review_id, &review.token, &review.confirmation_phrase)
        .await
        .unwrap();
    assert_eq!(outcome.kept_count, 1);
    assert_eq!(outcome.deleted_count, 0);

    let memory = core
        .store
        .get_memory_by_id(selections[0].memory_id)
        .unwrap()
        .unwrap();
    assert_eq!(memory.vitality_score, core.config.governance.vitality_max);
}

#[tokio::test]
async fn stale_hash_rejected_at_prepare() {
    let core = test_core();
    let mut selections = orphan_selections(&core, 1).await;
    selections[0].state_hash = "0".repeat(64);

    let err = core
        .reviews
        .prepare("delete", None, &selections, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "stale_state");
}

#[tokio::test]
async fn pending_cap_rejects_with_full() {
    let core = helpers::core_with(|config| {
        config.governance.max_pending_reviews = 1;
    });
    let selections = orphan_selections(&core, 2).await;

    core.reviews
        .prepare("delete", None, &selections[..1], None)
        .await
        .unwrap();
    let err = core
        .reviews
        .prepare("delete", None, &selections[1..], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "pending_reviews_full");
}

#[tokio::test]
async fn unknown_review_is_not_found() {
    let core = test_core();
    let err = core
        .reviews
        .confirm("cleanup-nope", "token", "phrase")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "review_not_found");
}
