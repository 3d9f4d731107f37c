//! Registry interface step definitions.

use std::collections::{BTreeSet, HashMap};

use boardwatch::registry::SUBSCRIBE_GRACE_WINDOW;
use boardwatch::{Board, ChatId, Registry, StorageError, Timestamp};
use chrono::Utc;
use cucumber::{given, then, when, World};

use crate::backend::{StorageBackend, StorageContext};

/// Test context for registry scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct RegistryWorld {
    backend: StorageBackend,
    context: Option<StorageContext>,
    /// Watermarks observed right after each Given step, per board.
    baselines: HashMap<String, Timestamp>,
    /// Wall clock bounds around the last subscribe.
    subscribe_window: Option<(Timestamp, Timestamp)>,
    last_result: Option<Result<(), StorageError>>,
}

impl RegistryWorld {
    fn new() -> Self {
        Self {
            backend: StorageBackend::from_env(),
            context: None,
            baselines: HashMap::new(),
            subscribe_window: None,
            last_result: None,
        }
    }

    fn registry(&self) -> &Registry {
        &self
            .context
            .as_ref()
            .expect("Storage context not initialized")
            .registry
    }

    async fn board(&self, name: &str) -> Board {
        self.registry()
            .board_details(name)
            .await
            .expect("Failed to read board details")
    }

    async fn remember_watermark(&mut self, name: &str) {
        let watermark = self.board(name).await.watermark;
        self.baselines.insert(name.to_string(), watermark);
    }
}

fn parse_ids(list: &str) -> BTreeSet<ChatId> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().expect("chat id list must hold integers"))
        .collect()
}

// --- Background ---

#[given("a registry backend")]
async fn given_registry_backend(world: &mut RegistryWorld) {
    println!("Using backend: {}", world.backend.name());
    let ctx = StorageContext::new(world.backend).await;
    world.context = Some(ctx);
}

// --- Given steps ---

#[given(expr = "chat {int} is subscribed to board {string}")]
async fn given_chat_subscribed(world: &mut RegistryWorld, chat_id: ChatId, board: String) {
    world
        .registry()
        .subscribe_chat(&board, chat_id)
        .await
        .expect("Failed to subscribe chat");
    world.remember_watermark(&board).await;
}

#[given(expr = "board {string} has watermark {int}")]
async fn given_board_watermark(world: &mut RegistryWorld, board: String, timestamp: Timestamp) {
    world
        .registry()
        .update_board_timestamp(&board, timestamp)
        .await
        .expect("Failed to set watermark");
    world.remember_watermark(&board).await;
}

// --- When steps ---

#[when(expr = "chat {int} subscribes to board {string}")]
async fn when_chat_subscribes(world: &mut RegistryWorld, chat_id: ChatId, board: String) {
    let before = Utc::now().timestamp();
    let result = world.registry().subscribe_chat(&board, chat_id).await;
    let after = Utc::now().timestamp();

    world.subscribe_window = Some((before, after));
    world.last_result = Some(result);
}

#[when(expr = "chat {int} subscribes to board {string} {int} times concurrently")]
async fn when_chat_subscribes_concurrently(
    world: &mut RegistryWorld,
    chat_id: ChatId,
    board: String,
    times: usize,
) {
    let handles: Vec<_> = (0..times)
        .map(|_| {
            let registry = world.registry().clone();
            let board = board.clone();
            tokio::spawn(async move { registry.subscribe_chat(&board, chat_id).await })
        })
        .collect();

    for handle in handles {
        handle
            .await
            .expect("Subscribe task panicked")
            .expect("Concurrent subscribe failed");
    }
}

#[when(expr = "chat {int} unsubscribes from board {string}")]
async fn when_chat_unsubscribes(world: &mut RegistryWorld, chat_id: ChatId, board: String) {
    let result = world.registry().unsubscribe_chat(&board, chat_id).await;
    world.last_result = Some(result);
}

#[when(expr = "board {string} watermark is set to {int}")]
async fn when_watermark_set(world: &mut RegistryWorld, board: String, timestamp: Timestamp) {
    world
        .registry()
        .update_board_timestamp(&board, timestamp)
        .await
        .expect("Failed to set watermark");
}

#[when(expr = "I request details of board {string}")]
async fn when_request_details(world: &mut RegistryWorld, board: String) {
    let result = world.registry().board_details(&board).await.map(|_| ());
    world.last_result = Some(result);
}

#[when(expr = "chat {int} is recorded as failed")]
async fn when_chat_recorded_failed(world: &mut RegistryWorld, chat_id: ChatId) {
    world
        .registry()
        .record_failed_chat(chat_id)
        .await
        .expect("Failed to record failed chat");
}

// --- Then steps ---

#[then("the operation should succeed")]
fn then_operation_succeeds(world: &mut RegistryWorld) {
    match world.last_result.as_ref().expect("No operation recorded") {
        Ok(()) => {}
        Err(e) => panic!("Expected success, got {}", e),
    }
}

#[then("the operation should fail with not found")]
fn then_fails_not_found(world: &mut RegistryWorld) {
    let result = world.last_result.as_ref().expect("No operation recorded");
    assert!(
        matches!(result, Err(StorageError::NotFound { .. })),
        "Expected NotFound, got {:?}",
        result
    );
}

#[then("the operation should fail with invalid board name")]
fn then_fails_invalid_name(world: &mut RegistryWorld) {
    let result = world.last_result.as_ref().expect("No operation recorded");
    assert!(
        matches!(result, Err(StorageError::InvalidBoardName)),
        "Expected InvalidBoardName, got {:?}",
        result
    );
}

#[then(expr = "the board names should include {string}")]
async fn then_names_include(world: &mut RegistryWorld, board: String) {
    let names = world.registry().all_board_names().await.expect("names");
    assert!(names.contains(&board), "{:?} does not include {}", names, board);
}

#[then(expr = "the board names should be exactly {string}")]
async fn then_names_exactly(world: &mut RegistryWorld, board: String) {
    let names = world.registry().all_board_names().await.expect("names");
    assert_eq!(names, vec![board]);
}

#[then("the board names should be empty")]
async fn then_names_empty(world: &mut RegistryWorld) {
    let names = world.registry().all_board_names().await.expect("names");
    assert!(names.is_empty(), "Expected no boards, got {:?}", names);
}

#[then(expr = "board {string} should have subscribers {string}")]
async fn then_board_subscribers(world: &mut RegistryWorld, board: String, expected: String) {
    let details = world.board(&board).await;
    assert_eq!(details.subscribers, parse_ids(&expected));
}

#[then(expr = "board {string} should have no subscribers")]
async fn then_board_no_subscribers(world: &mut RegistryWorld, board: String) {
    let details = world.board(&board).await;
    assert!(
        details.subscribers.is_empty(),
        "Expected no subscribers, got {:?}",
        details.subscribers
    );
}

#[then(expr = "board {string} watermark should be {int}")]
async fn then_board_watermark(world: &mut RegistryWorld, board: String, expected: Timestamp) {
    assert_eq!(world.board(&board).await.watermark, expected);
}

#[then(expr = "board {string} watermark should be unchanged")]
async fn then_board_watermark_unchanged(world: &mut RegistryWorld, board: String) {
    let expected = *world
        .baselines
        .get(&board)
        .expect("No baseline watermark recorded");
    assert_eq!(world.board(&board).await.watermark, expected);
}

#[then(expr = "board {string} watermark should be {int} seconds before now")]
async fn then_board_watermark_grace(world: &mut RegistryWorld, board: String, seconds: i64) {
    assert_eq!(seconds, SUBSCRIBE_GRACE_WINDOW.as_secs() as i64);

    let (before, after) = world.subscribe_window.expect("No subscribe recorded");
    let watermark = world.board(&board).await.watermark;
    assert!(
        watermark >= before - seconds && watermark <= after - seconds,
        "Watermark {} not within [{}, {}]",
        watermark,
        before - seconds,
        after - seconds
    );
}

#[then(expr = "chat {int} should be a failed chat")]
async fn then_chat_failed(world: &mut RegistryWorld, chat_id: ChatId) {
    assert!(world
        .registry()
        .is_failed_chat(chat_id)
        .await
        .expect("is_failed_chat"));
}

#[then(expr = "chat {int} should not be a failed chat")]
async fn then_chat_not_failed(world: &mut RegistryWorld, chat_id: ChatId) {
    assert!(!world
        .registry()
        .is_failed_chat(chat_id)
        .await
        .expect("is_failed_chat"));
}

#[then(expr = "the failed chats should be {string}")]
async fn then_failed_chats(world: &mut RegistryWorld, expected: String) {
    let chats: BTreeSet<ChatId> = world
        .registry()
        .failed_chats()
        .await
        .expect("failed_chats")
        .into_iter()
        .collect();
    assert_eq!(chats, parse_ids(&expected));
}
