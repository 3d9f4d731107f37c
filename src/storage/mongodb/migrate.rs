//! Single-collection to split-layout migration.

use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::Client;
use tracing::{info, warn};

use crate::storage::{Result, StorageError};

use super::{board_from_document, MongoSplitStore, BOARDS_COLLECTION};

/// Counts of what a migration run copied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    /// Boards read from the `boards` collection.
    pub boards: u64,
    /// Subscription pairs written (existing pairs included).
    pub subscriptions: u64,
}

/// Copy every board from the single-collection layout into the split layout.
///
/// Safe to run repeatedly: descriptions are upserted with `$max` on the
/// watermark and subscription pairs are upserted against their unique index.
/// The `boards` collection is left untouched.
pub async fn migrate_single_to_split(
    client: &Client,
    database_name: &str,
    index_timeout: Duration,
) -> Result<MigrationReport> {
    let split = MongoSplitStore::new(client, database_name, index_timeout).await?;
    let boards = client
        .database(database_name)
        .collection::<Document>(BOARDS_COLLECTION);

    let mut cursor = boards
        .find(doc! {})
        .await
        .map_err(StorageError::unavailable("migrate"))?;

    let mut report = MigrationReport::default();
    while cursor
        .advance()
        .await
        .map_err(StorageError::unavailable("migrate"))?
    {
        let document: Document = cursor
            .deserialize_current()
            .map_err(StorageError::unavailable("migrate"))?;

        let Some(board) = board_from_document(&document) else {
            warn!(id = ?document.get("_id"), "Skipping board without a name");
            continue;
        };

        split.import_board(&board).await?;
        report.boards += 1;
        report.subscriptions += board.subscribers.len() as u64;
    }

    info!(
        boards = report.boards,
        subscriptions = report.subscriptions,
        "Migrated boards to split layout"
    );
    Ok(report)
}
