//! Single-collection layout: one `boards` document per board holding its
//! name, subscriber set and watermark.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::{Client, Collection};
use tracing::info;

use crate::storage::{
    check_target, Board, BoardTarget, BoardUpdate, ChatId, Result, StorageError,
    SubscriptionStore,
};

use super::{
    board_from_document, board_update_document, create_unique_index, drain, upsert_one,
    FailedChats, BOARDS_COLLECTION, NAME_FIELD,
};

/// MongoDB store using the single `boards` collection.
pub struct MongoBoardStore {
    boards: Collection<Document>,
    failed_chats: FailedChats,
}

impl MongoBoardStore {
    /// Create the store, ensuring its unique indexes first.
    pub async fn new(client: &Client, database_name: &str, index_timeout: Duration) -> Result<Self> {
        let database = client.database(database_name);
        let store = Self {
            boards: database.collection(BOARDS_COLLECTION),
            failed_chats: FailedChats::new(&database),
        };
        store.init(index_timeout).await?;

        info!(database = %database_name, "Board store ready (single layout)");
        Ok(store)
    }

    async fn init(&self, index_timeout: Duration) -> Result<()> {
        create_unique_index(
            &self.boards,
            BOARDS_COLLECTION,
            doc! { NAME_FIELD: 1 },
            index_timeout,
        )
        .await?;
        self.failed_chats.init(index_timeout).await
    }
}

#[async_trait]
impl SubscriptionStore for MongoBoardStore {
    async fn apply(&self, target: &BoardTarget, update: &BoardUpdate) -> Result<()> {
        check_target(target, update)?;
        if update.is_empty() {
            return Ok(());
        }

        let operation = update.operation;
        let document = board_update_document(update);
        match target {
            BoardTarget::Named(name) if update.upsert => {
                upsert_one(&self.boards, doc! { NAME_FIELD: name }, document, operation).await?;
            }
            BoardTarget::Named(name) => {
                self.boards
                    .update_one(doc! { NAME_FIELD: name }, document)
                    .await
                    .map_err(StorageError::unavailable(operation))?;
            }
            BoardTarget::All => {
                self.boards
                    .update_many(doc! {}, document)
                    .await
                    .map_err(StorageError::unavailable(operation))?;
            }
        }
        Ok(())
    }

    async fn board_names(&self) -> Result<Vec<String>> {
        let cursor = self
            .boards
            .find(doc! {})
            .projection(doc! { NAME_FIELD: 1, "_id": 0 })
            .await
            .map_err(StorageError::unavailable("board_names"))?;

        Ok(drain(cursor, "board_names")
            .await?
            .iter()
            .filter_map(|d| d.get_str(NAME_FIELD).ok().map(String::from))
            .collect())
    }

    async fn find_board(&self, name: &str) -> Result<Option<Board>> {
        let document = self
            .boards
            .find_one(doc! { NAME_FIELD: name })
            .await
            .map_err(StorageError::unavailable("find_board"))?;

        Ok(document.as_ref().and_then(board_from_document))
    }

    async fn record_failed_chat(&self, chat_id: ChatId) -> Result<()> {
        self.failed_chats.record(chat_id).await
    }

    async fn is_failed_chat(&self, chat_id: ChatId) -> Result<bool> {
        self.failed_chats.contains(chat_id).await
    }

    async fn failed_chats(&self) -> Result<Vec<ChatId>> {
        self.failed_chats.list().await
    }
}
