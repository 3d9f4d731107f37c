//! Split layout: subscription pairs, board descriptions and failed chats
//! live in separate collections.
//!
//! Watermark writes only touch `board_descriptions`, membership changes only
//! touch `board_subscriptions`. An update that needs both (subscribing a
//! chat, which may create the board) runs as one transaction when the
//! deployment supports it. On a standalone server the pair row is written
//! first: it stays invisible until the description exists, and it is removed
//! again if the description write fails.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::{TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::UpdateOptions;
use mongodb::{Client, ClientSession, Collection};
use tracing::{debug, info, warn};

use crate::storage::{
    check_target, Board, BoardTarget, BoardUpdate, ChatId, Membership, Result, StorageError,
    SubscriptionStore,
};

use super::{
    create_unique_index, description_update_document, drain, is_duplicate_key, read_i64,
    server_supports_transactions, upsert_one, FailedChats, BOARD_DESCRIPTIONS_COLLECTION,
    BOARD_NAME_FIELD, BOARD_SUBSCRIPTIONS_COLLECTION, CHAT_ID_FIELD, NAME_FIELD,
    TIMESTAMP_FIELD,
};

/// Attempts for a transaction that keeps hitting transient conflicts.
const TRANSACTION_ATTEMPTS: usize = 5;

/// MongoDB store using the split collections.
pub struct MongoSplitStore {
    client: Client,
    subscriptions: Collection<Document>,
    descriptions: Collection<Document>,
    failed_chats: FailedChats,
    transactions: bool,
}

impl MongoSplitStore {
    /// Create the store, ensuring its unique indexes first.
    pub async fn new(client: &Client, database_name: &str, index_timeout: Duration) -> Result<Self> {
        let database = client.database(database_name);
        let store = Self {
            client: client.clone(),
            subscriptions: database.collection(BOARD_SUBSCRIPTIONS_COLLECTION),
            descriptions: database.collection(BOARD_DESCRIPTIONS_COLLECTION),
            failed_chats: FailedChats::new(&database),
            transactions: server_supports_transactions(client).await?,
        };
        store.init(index_timeout).await?;

        info!(
            database = %database_name,
            transactions = store.transactions,
            "Board store ready (split layout)"
        );
        Ok(store)
    }

    async fn init(&self, index_timeout: Duration) -> Result<()> {
        // Pair uniqueness holds even when concurrent subscribes race
        create_unique_index(
            &self.subscriptions,
            BOARD_SUBSCRIPTIONS_COLLECTION,
            doc! { BOARD_NAME_FIELD: 1, CHAT_ID_FIELD: 1 },
            index_timeout,
        )
        .await?;
        create_unique_index(
            &self.descriptions,
            BOARD_DESCRIPTIONS_COLLECTION,
            doc! { NAME_FIELD: 1 },
            index_timeout,
        )
        .await?;
        self.failed_chats.init(index_timeout).await
    }

    /// Insert the `(board, chat)` pair unless it already exists. Returns
    /// whether a row was inserted.
    async fn add_subscription(
        &self,
        name: &str,
        chat_id: ChatId,
        operation: &'static str,
    ) -> Result<bool> {
        let options = UpdateOptions::builder().upsert(true).build();

        match self
            .subscriptions
            .update_one(pair_filter(name, chat_id), pair_insert(name, chat_id))
            .with_options(options)
            .await
        {
            Ok(result) => Ok(result.upserted_id.is_some()),
            Err(e) if is_duplicate_key(&e) => {
                debug!(board = name, chat_id, "Subscription already present");
                Ok(false)
            }
            Err(e) => Err(StorageError::unavailable(operation)(e)),
        }
    }

    /// Delete the `(board, chat)` pair. Returns whether a row was removed.
    async fn remove_subscription(
        &self,
        name: &str,
        chat_id: ChatId,
        operation: &'static str,
    ) -> Result<bool> {
        let result = self
            .subscriptions
            .delete_many(pair_filter(name, chat_id))
            .await
            .map_err(StorageError::unavailable(operation))?;
        Ok(result.deleted_count > 0)
    }

    async fn write_membership(
        &self,
        name: &str,
        membership: Membership,
        operation: &'static str,
    ) -> Result<bool> {
        match membership {
            Membership::AddChat(chat_id) => self.add_subscription(name, chat_id, operation).await,
            Membership::RemoveChat(chat_id) => {
                self.remove_subscription(name, chat_id, operation).await
            }
        }
    }

    async fn undo_membership(
        &self,
        name: &str,
        membership: Membership,
        operation: &'static str,
    ) -> Result<()> {
        match membership {
            Membership::AddChat(chat_id) => {
                self.remove_subscription(name, chat_id, operation).await?;
            }
            Membership::RemoveChat(chat_id) => {
                self.add_subscription(name, chat_id, operation).await?;
            }
        }
        Ok(())
    }

    async fn write_description(
        &self,
        name: &str,
        description: Document,
        update: &BoardUpdate,
    ) -> Result<()> {
        let filter = doc! { NAME_FIELD: name };
        if update.upsert {
            upsert_one(&self.descriptions, filter, description, update.operation).await?;
        } else {
            self.descriptions
                .update_one(filter, description)
                .await
                .map_err(StorageError::unavailable(update.operation))?;
        }
        Ok(())
    }

    /// Description and membership change in one transaction.
    async fn apply_in_transaction(
        &self,
        name: &str,
        description: Document,
        membership: Membership,
        update: &BoardUpdate,
    ) -> Result<()> {
        let operation = update.operation;
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(StorageError::unavailable(operation))?;

        let mut attempt = 1;
        loop {
            match self
                .run_transaction(&mut session, name, &description, membership, update.upsert)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt < TRANSACTION_ATTEMPTS
                        && (e.contains_label(TRANSIENT_TRANSACTION_ERROR)
                            || is_duplicate_key(&e)) =>
                {
                    debug!(board = name, operation, attempt, "Transaction conflict, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(StorageError::unavailable(operation)(e)),
            }
        }
    }

    async fn run_transaction(
        &self,
        session: &mut ClientSession,
        name: &str,
        description: &Document,
        membership: Membership,
        upsert: bool,
    ) -> mongodb::error::Result<()> {
        session.start_transaction().await?;

        if let Err(e) = self
            .transaction_writes(session, name, description, membership, upsert)
            .await
        {
            // Aborting can fail on a broken connection; the server drops the
            // transaction on its own then.
            let _ = session.abort_transaction().await;
            return Err(e);
        }

        let mut attempt = 1;
        loop {
            match session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt < TRANSACTION_ATTEMPTS
                        && e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) =>
                {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transaction_writes(
        &self,
        session: &mut ClientSession,
        name: &str,
        description: &Document,
        membership: Membership,
        upsert: bool,
    ) -> mongodb::error::Result<()> {
        self.descriptions
            .update_one(doc! { NAME_FIELD: name }, description.clone())
            .with_options(UpdateOptions::builder().upsert(upsert).build())
            .session(&mut *session)
            .await?;

        match membership {
            Membership::AddChat(chat_id) => {
                self.subscriptions
                    .update_one(pair_filter(name, chat_id), pair_insert(name, chat_id))
                    .with_options(UpdateOptions::builder().upsert(true).build())
                    .session(&mut *session)
                    .await?;
            }
            Membership::RemoveChat(chat_id) => {
                self.subscriptions
                    .delete_many(pair_filter(name, chat_id))
                    .session(&mut *session)
                    .await?;
            }
        }
        Ok(())
    }

    /// Description and membership change without a transaction.
    async fn apply_without_transaction(
        &self,
        name: &str,
        description: Document,
        membership: Membership,
        update: &BoardUpdate,
    ) -> Result<()> {
        let operation = update.operation;
        membership_then_description(
            self.write_membership(name, membership, operation),
            self.write_description(name, description, update),
            self.undo_membership(name, membership, operation),
        )
        .await
    }

    /// Copy one single-layout board into this layout.
    ///
    /// The watermark is merged with `$max` so importing never moves an
    /// existing description backwards.
    pub(crate) async fn import_board(&self, board: &Board) -> Result<()> {
        upsert_one(
            &self.descriptions,
            doc! { NAME_FIELD: &board.name },
            doc! { "$max": { TIMESTAMP_FIELD: board.watermark } },
            "migrate",
        )
        .await?;

        for chat_id in &board.subscribers {
            self.add_subscription(&board.name, *chat_id, "migrate")
                .await?;
        }
        Ok(())
    }
}

fn pair_filter(name: &str, chat_id: ChatId) -> Document {
    doc! { BOARD_NAME_FIELD: name, CHAT_ID_FIELD: chat_id }
}

fn pair_insert(name: &str, chat_id: ChatId) -> Document {
    doc! { "$setOnInsert": { BOARD_NAME_FIELD: name, CHAT_ID_FIELD: chat_id } }
}

/// Run the membership write, then the description write. When the
/// description write fails after the membership write changed a row, `undo`
/// restores that row before the description error is returned.
///
/// A pair row without a description is not visible to readers, so the
/// intermediate state is never observed as a board.
async fn membership_then_description<M, D, U>(membership: M, description: D, undo: U) -> Result<()>
where
    M: Future<Output = Result<bool>>,
    D: Future<Output = Result<()>>,
    U: Future<Output = Result<()>>,
{
    let changed = membership.await?;

    if let Err(err) = description.await {
        if changed {
            if let Err(undo_err) = undo.await {
                warn!(error = %undo_err, "Failed to roll back subscription change");
            }
        }
        return Err(err);
    }
    Ok(())
}

#[async_trait]
impl SubscriptionStore for MongoSplitStore {
    async fn apply(&self, target: &BoardTarget, update: &BoardUpdate) -> Result<()> {
        check_target(target, update)?;
        let operation = update.operation;

        match target {
            BoardTarget::Named(name) => {
                match (description_update_document(update), update.membership) {
                    (Some(description), Some(membership)) if self.transactions => {
                        self.apply_in_transaction(name, description, membership, update)
                            .await
                    }
                    (Some(description), Some(membership)) => {
                        self.apply_without_transaction(name, description, membership, update)
                            .await
                    }
                    (Some(description), None) => {
                        self.write_description(name, description, update).await
                    }
                    (None, Some(membership)) => self
                        .write_membership(name, membership, operation)
                        .await
                        .map(|_| ()),
                    (None, None) => Ok(()),
                }
            }
            BoardTarget::All => {
                if let Some(Membership::RemoveChat(chat_id)) = update.membership {
                    self.subscriptions
                        .delete_many(doc! { CHAT_ID_FIELD: chat_id })
                        .await
                        .map_err(StorageError::unavailable(operation))?;
                }
                Ok(())
            }
        }
    }

    async fn board_names(&self) -> Result<Vec<String>> {
        let cursor = self
            .descriptions
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
        let Some(description) = self
            .descriptions
            .find_one(doc! { NAME_FIELD: name })
            .await
            .map_err(StorageError::unavailable("find_board"))?
        else {
            return Ok(None);
        };

        let cursor = self
            .subscriptions
            .find(doc! { BOARD_NAME_FIELD: name })
            .projection(doc! { CHAT_ID_FIELD: 1, "_id": 0 })
            .await
            .map_err(StorageError::unavailable("find_board"))?;

        let subscribers: BTreeSet<ChatId> = drain(cursor, "find_board")
            .await?
            .iter()
            .filter_map(|d| d.get(CHAT_ID_FIELD).and_then(read_i64))
            .collect();

        Ok(Some(Board {
            name: name.to_string(),
            subscribers,
            watermark: description
                .get(TIMESTAMP_FIELD)
                .and_then(read_i64)
                .unwrap_or(0),
        }))
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
