//! MongoDB implementations of the subscription store.
//!
//! Field and collection names below are private to this module; nothing
//! outside the adapter encodes them.

mod board_store;
mod migrate;
mod split_store;

use std::future::Future;
use std::time::Duration;

use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, UpdateOptions};
use mongodb::results::UpdateResult;
use mongodb::{Client, Collection, Cursor, Database, IndexModel};
use tracing::{debug, info};

use crate::config::MongodbConfig;
use crate::storage::{Board, BoardUpdate, ChatId, Membership, Result, StorageError, WatermarkUpdate};

pub use board_store::MongoBoardStore;
pub use migrate::{migrate_single_to_split, MigrationReport};
pub use split_store::MongoSplitStore;

/// Collection names.
pub(crate) const BOARDS_COLLECTION: &str = "boards";
pub(crate) const BOARD_SUBSCRIPTIONS_COLLECTION: &str = "board_subscriptions";
pub(crate) const BOARD_DESCRIPTIONS_COLLECTION: &str = "board_descriptions";
pub(crate) const FAILED_CHATS_COLLECTION: &str = "failed_chats";

/// Field names.
pub(crate) const NAME_FIELD: &str = "name";
pub(crate) const CHAT_IDS_FIELD: &str = "chatIDs";
pub(crate) const TIMESTAMP_FIELD: &str = "timestamp";
pub(crate) const BOARD_NAME_FIELD: &str = "boardName";
pub(crate) const CHAT_ID_FIELD: &str = "chatID";

const APP_NAME: &str = "boardwatch";
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Connect to MongoDB and verify the server answers.
///
/// The driver connects lazily, so a `ping` against the configured database is
/// issued to fail fast on an unreachable server instead of on the first
/// registry call.
pub async fn connect(config: &MongodbConfig) -> Result<Client> {
    let mut options = ClientOptions::parse(&config.uri)
        .await
        .map_err(|e| StorageError::ConnectionFailure(format!("invalid MongoDB URI: {}", e)))?;
    options.app_name = Some(APP_NAME.to_string());
    options.server_selection_timeout = Some(config.connect_timeout());

    let client = Client::with_options(options)
        .map_err(|e| StorageError::ConnectionFailure(e.to_string()))?;

    client
        .database(&config.database)
        .run_command(doc! { "ping": 1 })
        .await
        .map_err(|e| {
            StorageError::ConnectionFailure(format!(
                "cannot reach MongoDB for database {}: {}",
                config.database, e
            ))
        })?;

    info!(database = %config.database, "Connected to MongoDB");
    Ok(client)
}

/// Whether a `hello` reply comes from a deployment that runs multi-document
/// transactions: a replica set member or a `mongos` router.
pub(crate) fn supports_transactions(hello: &Document) -> bool {
    hello.contains_key("setName") || hello.get_str("msg").is_ok_and(|m| m == "isdbgrid")
}

pub(crate) async fn server_supports_transactions(client: &Client) -> Result<bool> {
    let hello = client
        .database("admin")
        .run_command(doc! { "hello": 1 })
        .await
        .map_err(|e| StorageError::ConnectionFailure(e.to_string()))?;
    Ok(supports_transactions(&hello))
}

/// Unique sparse index.
fn unique_index(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).sparse(true).build())
        .build()
}

/// Create a unique index, bounded by `timeout`. Re-creating an identical
/// index is a no-op, so the whole setup sequence can be retried.
pub(crate) async fn create_unique_index(
    collection: &Collection<Document>,
    collection_name: &'static str,
    keys: Document,
    timeout: Duration,
) -> Result<()> {
    with_index_timeout(collection_name, timeout, async {
        collection
            .create_index(unique_index(keys))
            .await
            .map(|_| ())
            .map_err(|e| StorageError::IndexSetupFailed {
                collection: collection_name,
                message: e.to_string(),
            })
    })
    .await?;
    debug!(collection = collection_name, "Unique index ensured");
    Ok(())
}

/// Bound index setup on `collection_name` by `timeout`.
pub(crate) async fn with_index_timeout<F>(
    collection_name: &'static str,
    timeout: Duration,
    setup: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(timeout, setup)
        .await
        .map_err(|_| StorageError::IndexSetupFailed {
            collection: collection_name,
            message: format!("timed out after {:?}", timeout),
        })?
}

pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

/// Upsert a single document.
///
/// Two concurrent upserts on the same unique key can both miss and race to
/// insert; the loser gets a duplicate-key error. The document exists by
/// then, so the same request is sent once more and lands as an update.
pub(crate) async fn upsert_one(
    collection: &Collection<Document>,
    filter: Document,
    update: Document,
    operation: &'static str,
) -> Result<UpdateResult> {
    let options = UpdateOptions::builder().upsert(true).build();

    match collection
        .update_one(filter.clone(), update.clone())
        .with_options(options.clone())
        .await
    {
        Err(e) if is_duplicate_key(&e) => {
            debug!(
                operation,
                collection = collection.name(),
                "Upsert lost insert race, retrying as update"
            );
            collection
                .update_one(filter, update)
                .with_options(options)
                .await
                .map_err(StorageError::unavailable(operation))
        }
        other => other.map_err(StorageError::unavailable(operation)),
    }
}

pub(crate) async fn drain(
    mut cursor: Cursor<Document>,
    operation: &'static str,
) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    while cursor
        .advance()
        .await
        .map_err(StorageError::unavailable(operation))?
    {
        documents.push(
            cursor
                .deserialize_current()
                .map_err(StorageError::unavailable(operation))?,
        );
    }
    Ok(documents)
}

/// Numeric fields written by older clients may be 32-bit.
pub(crate) fn read_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int64(v) => Some(*v),
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

/// Decode a single-layout `boards` document.
pub(crate) fn board_from_document(document: &Document) -> Option<Board> {
    let name = document.get_str(NAME_FIELD).ok()?;
    let subscribers = document
        .get_array(CHAT_IDS_FIELD)
        .map(|ids| ids.iter().filter_map(read_i64).collect())
        .unwrap_or_default();
    let watermark = document
        .get(TIMESTAMP_FIELD)
        .and_then(read_i64)
        .unwrap_or(0);

    Some(Board {
        name: name.to_string(),
        subscribers,
        watermark,
    })
}

/// Translate an update intent into a `boards` update document.
///
/// An upsert always seeds both the subscriber set and the watermark so a
/// freshly inserted board is complete.
pub(crate) fn board_update_document(update: &BoardUpdate) -> Document {
    let mut document = Document::new();
    let mut set = Document::new();
    let mut set_on_insert = Document::new();

    match update.membership {
        Some(Membership::AddChat(chat_id)) => {
            document.insert("$addToSet", doc! { CHAT_IDS_FIELD: chat_id });
        }
        Some(Membership::RemoveChat(chat_id)) => {
            document.insert("$pull", doc! { CHAT_IDS_FIELD: chat_id });
        }
        None if update.upsert => {
            set_on_insert.insert(CHAT_IDS_FIELD, Bson::Array(Vec::new()));
        }
        None => {}
    }

    match update.watermark {
        Some(WatermarkUpdate::Set(ts)) => {
            set.insert(TIMESTAMP_FIELD, ts);
        }
        Some(WatermarkUpdate::SetOnInsert(ts)) => {
            set_on_insert.insert(TIMESTAMP_FIELD, ts);
        }
        None if update.upsert => {
            set_on_insert.insert(TIMESTAMP_FIELD, update.insert_watermark());
        }
        None => {}
    }

    if !set.is_empty() {
        document.insert("$set", set);
    }
    if !set_on_insert.is_empty() {
        document.insert("$setOnInsert", set_on_insert);
    }
    document
}

/// Translate the watermark part of an update intent into a
/// `board_descriptions` update document.
pub(crate) fn description_update_document(update: &BoardUpdate) -> Option<Document> {
    match update.watermark {
        Some(WatermarkUpdate::Set(ts)) => Some(doc! { "$set": { TIMESTAMP_FIELD: ts } }),
        Some(WatermarkUpdate::SetOnInsert(ts)) => {
            Some(doc! { "$setOnInsert": { TIMESTAMP_FIELD: ts } })
        }
        None if update.upsert => Some(doc! {
            "$setOnInsert": { TIMESTAMP_FIELD: update.insert_watermark() }
        }),
        None => None,
    }
}

/// The `failed_chats` collection, shared by both layouts.
pub(crate) struct FailedChats {
    collection: Collection<Document>,
}

impl FailedChats {
    pub(crate) fn new(database: &Database) -> Self {
        Self {
            collection: database.collection(FAILED_CHATS_COLLECTION),
        }
    }

    pub(crate) async fn init(&self, index_timeout: Duration) -> Result<()> {
        create_unique_index(
            &self.collection,
            FAILED_CHATS_COLLECTION,
            doc! { CHAT_ID_FIELD: 1 },
            index_timeout,
        )
        .await
    }

    pub(crate) async fn record(&self, chat_id: ChatId) -> Result<()> {
        upsert_one(
            &self.collection,
            doc! { CHAT_ID_FIELD: chat_id },
            doc! { "$setOnInsert": { CHAT_ID_FIELD: chat_id } },
            "record_failed_chat",
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn contains(&self, chat_id: ChatId) -> Result<bool> {
        let found = self
            .collection
            .find_one(doc! { CHAT_ID_FIELD: chat_id })
            .projection(doc! { "_id": 1 })
            .await
            .map_err(StorageError::unavailable("is_failed_chat"))?;
        Ok(found.is_some())
    }

    pub(crate) async fn list(&self) -> Result<Vec<ChatId>> {
        let cursor = self
            .collection
            .find(doc! {})
            .projection(doc! { CHAT_ID_FIELD: 1, "_id": 0 })
            .await
            .map_err(StorageError::unavailable("failed_chats"))?;

        let mut chat_ids: Vec<ChatId> = drain(cursor, "failed_chats")
            .await?
            .iter()
            .filter_map(|d| d.get(CHAT_ID_FIELD).and_then(read_i64))
            .collect();
        chat_ids.sort_unstable();
        Ok(chat_ids)
    }
}
