//! Registry contract tests.
//!
//! These tests verify the subscription contract through the `Registry` so
//! every `SubscriptionStore` implementation is held to the same behavior.
//! Board names start with `test_` so runs against a shared server can be
//! cleaned up.

use std::collections::BTreeSet;

use chrono::Utc;

use boardwatch::registry::SUBSCRIBE_GRACE_WINDOW;
use boardwatch::{ChatId, Registry, StorageError};

fn set(ids: &[ChatId]) -> BTreeSet<ChatId> {
    ids.iter().copied().collect()
}

// =============================================================================
// subscribe_chat tests
// =============================================================================

pub async fn test_subscribe_idempotent(registry: &Registry) {
    let board = "test_sub_idempotent";

    registry.subscribe_chat(board, 1).await.expect("subscribe");
    let first = registry.board_details(board).await.expect("details");

    registry.subscribe_chat(board, 1).await.expect("subscribe again");
    let second = registry.board_details(board).await.expect("details");

    assert_eq!(second.subscribers, set(&[1]), "subscriber set unchanged");
    assert_eq!(second.watermark, first.watermark, "watermark unchanged");
}

pub async fn test_subscribe_grace_window(registry: &Registry) {
    let board = "test_sub_grace";
    let grace = SUBSCRIBE_GRACE_WINDOW.as_secs() as i64;

    let before = Utc::now().timestamp();
    registry.subscribe_chat(board, 42).await.expect("subscribe");
    let after = Utc::now().timestamp();

    let details = registry.board_details(board).await.expect("details");
    assert!(
        details.watermark >= before - grace && details.watermark <= after - grace,
        "watermark {} should be about now - {}s",
        details.watermark,
        grace
    );
}

pub async fn test_subscribe_keeps_watermark(registry: &Registry) {
    let board = "test_sub_keeps_wm";

    registry
        .update_board_timestamp(board, 5_000)
        .await
        .expect("update");
    registry.subscribe_chat(board, 3).await.expect("subscribe");

    let details = registry.board_details(board).await.expect("details");
    assert_eq!(details.watermark, 5_000);
    assert_eq!(details.subscribers, set(&[3]));
}

pub async fn test_concurrent_subscribe_single_record(registry: &Registry) {
    let board = "test_sub_concurrent";

    let calls = (0..8).map(|_| registry.subscribe_chat(board, 77));
    for result in futures::future::join_all(calls).await {
        result.expect("concurrent subscribe should succeed");
    }

    let details = registry.board_details(board).await.expect("details");
    assert_eq!(details.subscribers, set(&[77]));

    let names = registry.all_board_names().await.expect("names");
    assert_eq!(
        names.iter().filter(|n| n.as_str() == board).count(),
        1,
        "board must exist exactly once"
    );
}

// =============================================================================
// unsubscribe_chat tests
// =============================================================================

pub async fn test_unsubscribe_non_member(registry: &Registry) {
    let board = "test_unsub_non_member";

    registry.subscribe_chat(board, 1).await.expect("subscribe");
    let before = registry.board_details(board).await.expect("details");

    registry
        .unsubscribe_chat(board, 2)
        .await
        .expect("unsubscribe non-member should succeed");

    assert_eq!(registry.board_details(board).await.unwrap(), before);
}

pub async fn test_global_unsubscribe(registry: &Registry) {
    let boards = ["test_global_a", "test_global_b", "test_global_c"];
    let chat = 555_001;

    for board in boards {
        registry.subscribe_chat(board, chat).await.expect("subscribe");
    }
    registry
        .subscribe_chat("test_global_b", 555_002)
        .await
        .expect("subscribe other");

    registry.unsubscribe_chat("", chat).await.expect("global");

    for board in boards {
        let details = registry.board_details(board).await.expect("details");
        assert!(!details.is_subscribed(chat), "{} still has chat", board);
    }
    assert!(registry
        .board_details("test_global_b")
        .await
        .unwrap()
        .is_subscribed(555_002));
}

// =============================================================================
// update_board_timestamp / board_details tests
// =============================================================================

pub async fn test_update_creates_board(registry: &Registry) {
    let board = "test_update_creates";

    registry
        .update_board_timestamp(board, 1_234)
        .await
        .expect("update");

    let details = registry.board_details(board).await.expect("details");
    assert!(details.subscribers.is_empty());
    assert_eq!(details.watermark, 1_234);
}

pub async fn test_details_not_found(registry: &Registry) {
    let result = registry.board_details("test_never_created").await;
    assert!(
        matches!(result, Err(StorageError::NotFound { .. })),
        "expected NotFound, got {:?}",
        result
    );
}

pub async fn test_news_scenario(registry: &Registry) {
    let board = "test_news";

    registry.subscribe_chat(board, 100).await.unwrap();
    assert!(registry
        .all_board_names()
        .await
        .unwrap()
        .iter()
        .any(|n| n == board));
    assert_eq!(
        registry.board_details(board).await.unwrap().subscribers,
        set(&[100])
    );

    registry.update_board_timestamp(board, 1_000).await.unwrap();
    let details = registry.board_details(board).await.unwrap();
    assert_eq!(details.subscribers, set(&[100]));
    assert_eq!(details.watermark, 1_000);

    registry.unsubscribe_chat(board, 100).await.unwrap();
    let details = registry.board_details(board).await.unwrap();
    assert!(details.subscribers.is_empty());
    assert_eq!(details.watermark, 1_000);
}

// =============================================================================
// failed chat tests
// =============================================================================

pub async fn test_failed_chat_unique(registry: &Registry) {
    let chat = 9_000_000_001;

    registry.record_failed_chat(chat).await.expect("record");
    registry.record_failed_chat(chat).await.expect("record again");

    assert!(registry.is_failed_chat(chat).await.unwrap());
    let all = registry.failed_chats().await.unwrap();
    assert_eq!(all.iter().filter(|c| **c == chat).count(), 1);
}

/// Run all registry contract tests against a registry.
#[macro_export]
macro_rules! run_registry_tests {
    ($registry:expr) => {
        use $crate::storage::registry_tests::*;

        // subscribe tests
        test_subscribe_idempotent($registry).await;
        println!("  test_subscribe_idempotent: PASSED");

        test_subscribe_grace_window($registry).await;
        println!("  test_subscribe_grace_window: PASSED");

        test_subscribe_keeps_watermark($registry).await;
        println!("  test_subscribe_keeps_watermark: PASSED");

        test_concurrent_subscribe_single_record($registry).await;
        println!("  test_concurrent_subscribe_single_record: PASSED");

        // unsubscribe tests
        test_unsubscribe_non_member($registry).await;
        println!("  test_unsubscribe_non_member: PASSED");

        test_global_unsubscribe($registry).await;
        println!("  test_global_unsubscribe: PASSED");

        // watermark / details tests
        test_update_creates_board($registry).await;
        println!("  test_update_creates_board: PASSED");

        test_details_not_found($registry).await;
        println!("  test_details_not_found: PASSED");

        test_news_scenario($registry).await;
        println!("  test_news_scenario: PASSED");

        // failed chats
        test_failed_chat_unique($registry).await;
        println!("  test_failed_chat_unique: PASSED");
    };
}
