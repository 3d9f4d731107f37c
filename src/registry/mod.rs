//! Subscription registry.
//!
//! Answers "who is subscribed to what" and "what was last seen". The registry
//! is stateless apart from the shared store handle: clone it freely and call
//! it from any number of tasks. Every mutation is a single [`BoardUpdate`]
//! handed to the store, so concurrent callers never interleave a
//! read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::storage::{
    init_storage, Board, BoardTarget, BoardUpdate, ChatId, Result, StorageConfig, StorageError,
    SubscriptionStore, Timestamp,
};

/// How far back a newly created board's watermark starts.
///
/// Content that appeared shortly before the first subscribe is still
/// delivered; duplicates at the subscription boundary are preferred over
/// missed updates.
pub const SUBSCRIBE_GRACE_WINDOW: Duration = Duration::from_secs(30);

/// Initial watermark for a board created by a subscribe at `now`.
pub fn initial_watermark(now: DateTime<Utc>) -> Timestamp {
    now.timestamp() - SUBSCRIBE_GRACE_WINDOW.as_secs() as i64
}

/// Board/chat subscription registry.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn SubscriptionStore>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("store", &"<dyn SubscriptionStore>")
            .finish()
    }
}

impl Registry {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Build a registry over the configured backend.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(Self::new(init_storage(config).await?))
    }

    /// Subscribe `chat_id` to `board_name`.
    ///
    /// Creates the board when needed, with its watermark set
    /// [`SUBSCRIBE_GRACE_WINDOW`] in the past. Repeating the call changes
    /// nothing and never resets the watermark of an existing board.
    pub async fn subscribe_chat(&self, board_name: &str, chat_id: ChatId) -> Result<()> {
        let name = require_name(board_name)?;
        let update = BoardUpdate::subscribe(chat_id, initial_watermark(Utc::now()));

        self.store
            .apply(&BoardTarget::Named(name.to_string()), &update)
            .await?;

        debug!(board = name, chat_id, "Chat subscribed");
        Ok(())
    }

    /// Unsubscribe `chat_id` from `board_name`.
    ///
    /// An empty `board_name` removes the chat from every board. Removing a
    /// chat that is not subscribed is not an error.
    pub async fn unsubscribe_chat(&self, board_name: &str, chat_id: ChatId) -> Result<()> {
        let target = BoardTarget::from_name(board_name);
        self.store
            .apply(&target, &BoardUpdate::unsubscribe(chat_id))
            .await?;

        debug!(?target, chat_id, "Chat unsubscribed");
        Ok(())
    }

    /// Remove `chat_id` from every board it is subscribed to.
    pub async fn unsubscribe_chat_everywhere(&self, chat_id: ChatId) -> Result<()> {
        self.unsubscribe_chat("", chat_id).await
    }

    /// Names of all known boards.
    pub async fn all_board_names(&self) -> Result<Vec<String>> {
        self.store.board_names().await
    }

    /// Subscribers and watermark of one board.
    pub async fn board_details(&self, board_name: &str) -> Result<Board> {
        let name = require_name(board_name)?;
        self.store
            .find_board(name)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                board: name.to_string(),
            })
    }

    /// Set the watermark of `board_name`.
    ///
    /// Unconditional: a value older than the current one is stored as is.
    /// Creates the board with no subscribers when it does not exist.
    pub async fn update_board_timestamp(
        &self,
        board_name: &str,
        timestamp: Timestamp,
    ) -> Result<()> {
        let name = require_name(board_name)?;
        self.store
            .apply(
                &BoardTarget::Named(name.to_string()),
                &BoardUpdate::set_watermark(timestamp),
            )
            .await?;

        debug!(board = name, timestamp, "Board watermark updated");
        Ok(())
    }

    /// Put `chat_id` on the failed-chat blocklist.
    pub async fn record_failed_chat(&self, chat_id: ChatId) -> Result<()> {
        self.store.record_failed_chat(chat_id).await?;
        debug!(chat_id, "Chat recorded as failed");
        Ok(())
    }

    pub async fn is_failed_chat(&self, chat_id: ChatId) -> Result<bool> {
        self.store.is_failed_chat(chat_id).await
    }

    pub async fn failed_chats(&self) -> Result<Vec<ChatId>> {
        self.store.failed_chats().await
    }
}

fn require_name(board_name: &str) -> Result<&str> {
    if board_name.is_empty() {
        return Err(StorageError::InvalidBoardName);
    }
    Ok(board_name)
}
