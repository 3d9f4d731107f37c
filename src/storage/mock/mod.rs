//! In-memory subscription store.
//!
//! Backs `storage.type = "memory"` and the unit tests. Writes hold the lock
//! for the whole update, so each `apply` is atomic like its MongoDB
//! counterpart.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    check_target, Board, BoardTarget, BoardUpdate, ChatId, Result, StorageError,
    SubscriptionStore,
};

/// Mock store that keeps boards and failed chats in memory.
#[derive(Default)]
pub struct MockSubscriptionStore {
    boards: RwLock<HashMap<String, Board>>,
    failed_chats: RwLock<BTreeSet<ChatId>>,
    fail_on_write: RwLock<bool>,
    fail_on_read: RwLock<bool>,
}

impl MockSubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutation fail with `StorageUnavailable`.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    /// Make every read fail with `StorageUnavailable`.
    pub async fn set_fail_on_read(&self, fail: bool) {
        *self.fail_on_read.write().await = fail;
    }

    pub async fn board_count(&self) -> usize {
        self.boards.read().await.len()
    }

    async fn check_write(&self, operation: &'static str) -> Result<()> {
        if *self.fail_on_write.read().await {
            return Err(StorageError::StorageUnavailable {
                operation,
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    async fn check_read(&self, operation: &'static str) -> Result<()> {
        if *self.fail_on_read.read().await {
            return Err(StorageError::StorageUnavailable {
                operation,
                message: "injected read failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MockSubscriptionStore {
    async fn apply(&self, target: &BoardTarget, update: &BoardUpdate) -> Result<()> {
        check_target(target, update)?;
        self.check_write(update.operation).await?;

        let mut boards = self.boards.write().await;
        match target {
            BoardTarget::Named(name) => match boards.get_mut(name) {
                Some(board) => update.apply_to(board, false),
                None if update.upsert => {
                    boards.insert(name.clone(), update.seed(name));
                }
                None => {}
            },
            BoardTarget::All => {
                for board in boards.values_mut() {
                    update.apply_to(board, false);
                }
            }
        }
        Ok(())
    }

    async fn board_names(&self) -> Result<Vec<String>> {
        self.check_read("board_names").await?;
        let mut names: Vec<String> = self.boards.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn find_board(&self, name: &str) -> Result<Option<Board>> {
        self.check_read("find_board").await?;
        Ok(self.boards.read().await.get(name).cloned())
    }

    async fn record_failed_chat(&self, chat_id: ChatId) -> Result<()> {
        self.check_write("record_failed_chat").await?;
        self.failed_chats.write().await.insert(chat_id);
        Ok(())
    }

    async fn is_failed_chat(&self, chat_id: ChatId) -> Result<bool> {
        self.check_read("is_failed_chat").await?;
        Ok(self.failed_chats.read().await.contains(&chat_id))
    }

    async fn failed_chats(&self) -> Result<Vec<ChatId>> {
        self.check_read("failed_chats").await?;
        Ok(self.failed_chats.read().await.iter().copied().collect())
    }
}
