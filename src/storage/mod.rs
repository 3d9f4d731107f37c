//! Subscription storage.
//!
//! [`SubscriptionStore`] is the seam between the registry and the physical
//! layout. Implementations:
//! - `MongoBoardStore`: single `boards` collection
//! - `MongoSplitStore`: subscriptions, descriptions and failed chats split
//! - `MockSubscriptionStore`: in-memory, with failure injection

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub mod mock;
mod update;

#[cfg(feature = "mongodb")]
pub mod mongodb;

pub use crate::config::{MongodbConfig, SchemaLayout, StorageConfig, StorageType};
pub use mock::MockSubscriptionStore;
pub use update::{BoardTarget, BoardUpdate, Membership, WatermarkUpdate};

#[cfg(feature = "mongodb")]
pub use self::mongodb::{MongoBoardStore, MongoSplitStore};

/// Opaque chat identifier.
pub type ChatId = i64;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Index setup failed on {collection}: {message}")]
    IndexSetupFailed {
        collection: &'static str,
        message: String,
    },

    #[error("Board not found: {board}")]
    NotFound { board: String },

    #[error("Storage unavailable during {operation}: {message}")]
    StorageUnavailable {
        operation: &'static str,
        message: String,
    },

    #[error("Board name must not be empty")]
    InvalidBoardName,

    #[error("Invalid update: {0}")]
    InvalidUpdate(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the caller may retry the failed operation.
    ///
    /// Setup and validation failures will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::StorageUnavailable { .. } | StorageError::ConnectionFailure(_)
        )
    }

    /// Wrap a backend error with the operation that produced it.
    pub fn unavailable<E: std::fmt::Display>(operation: &'static str) -> impl Fn(E) -> Self {
        move |e| StorageError::StorageUnavailable {
            operation,
            message: e.to_string(),
        }
    }
}

/// A named board with its subscribers and watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub name: String,
    pub subscribers: BTreeSet<ChatId>,
    /// Last processed point for this board.
    pub watermark: Timestamp,
}

impl Board {
    /// A board with no subscribers.
    pub fn empty(name: impl Into<String>, watermark: Timestamp) -> Self {
        Self {
            name: name.into(),
            subscribers: BTreeSet::new(),
            watermark,
        }
    }

    pub fn is_subscribed(&self, chat_id: ChatId) -> bool {
        self.subscribers.contains(&chat_id)
    }
}

/// Interface for subscription persistence.
///
/// Every method maps to at most a fixed number of round trips. Mutations go
/// through [`SubscriptionStore::apply`] so implementations can express each
/// one as an atomic update-with-modifiers rather than read-modify-write.
///
/// A store value is only handed out once its uniqueness constraints exist;
/// there is no separate initialization call.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Apply `update` to the boards selected by `target`.
    ///
    /// Upserts only for [`BoardTarget::Named`]; an upsert aimed at
    /// [`BoardTarget::All`] is rejected with `InvalidUpdate`.
    async fn apply(&self, target: &BoardTarget, update: &BoardUpdate) -> Result<()>;

    /// Names of every known board, reading only the name field.
    async fn board_names(&self) -> Result<Vec<String>>;

    /// Full record for one board, `None` if it was never created.
    async fn find_board(&self, name: &str) -> Result<Option<Board>>;

    /// Add `chat_id` to the failed-chat blocklist. Idempotent.
    async fn record_failed_chat(&self, chat_id: ChatId) -> Result<()>;

    /// Whether `chat_id` is on the failed-chat blocklist.
    async fn is_failed_chat(&self, chat_id: ChatId) -> Result<bool>;

    /// Every chat on the failed-chat blocklist.
    async fn failed_chats(&self) -> Result<Vec<ChatId>>;
}

/// Reject update intents that have no single-board translation.
pub(crate) fn check_target(target: &BoardTarget, update: &BoardUpdate) -> Result<()> {
    match target {
        BoardTarget::All if update.upsert => Err(StorageError::InvalidUpdate(
            "upsert requires a named board",
        )),
        BoardTarget::All if update.watermark.is_some() => Err(StorageError::InvalidUpdate(
            "watermark updates require a named board",
        )),
        BoardTarget::Named(name) if name.is_empty() => Err(StorageError::InvalidBoardName),
        _ if !update.upsert && matches!(update.membership, Some(Membership::AddChat(_))) => {
            Err(StorageError::InvalidUpdate(
                "adding a chat may create the board and requires an upsert",
            ))
        }
        _ => Ok(()),
    }
}

/// Initialize storage based on configuration.
///
/// For MongoDB this connects, pings, and creates the layout's indexes before
/// returning.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn SubscriptionStore>> {
    info!(
        "Storage: {:?} with {:?} layout",
        config.storage_type, config.layout
    );

    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MockSubscriptionStore::new())),
        #[cfg(feature = "mongodb")]
        StorageType::Mongodb => {
            let client = self::mongodb::connect(&config.mongodb).await?;
            let database = config.mongodb.database.as_str();
            let index_timeout = config.mongodb.index_timeout();

            let store: Arc<dyn SubscriptionStore> = match config.layout {
                SchemaLayout::Single => {
                    Arc::new(MongoBoardStore::new(&client, database, index_timeout).await?)
                }
                SchemaLayout::Split => {
                    Arc::new(MongoSplitStore::new(&client, database, index_timeout).await?)
                }
            };
            Ok(store)
        }
        #[cfg(not(feature = "mongodb"))]
        StorageType::Mongodb => {
            tracing::error!("MongoDB storage requested but 'mongodb' feature is not enabled");
            Err(StorageError::Config(
                "MongoDB feature not enabled".to_string(),
            ))
        }
    }
}
