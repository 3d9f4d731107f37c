//! boardwatch-migrate: single-collection to split-layout migration
//!
//! Copies every document of the `boards` collection into
//! `board_descriptions` and `board_subscriptions`, creating the split
//! layout's unique indexes first. The run can be repeated; the `boards`
//! collection is not modified.
//!
//! ## Configuration
//! - BOARDWATCH_CONFIG: path to a YAML config file (optional)
//! - BOARDWATCH__STORAGE__MONGODB__URI / __DATABASE: connection overrides
//! - BOARDWATCH_LOG: tracing filter (default: info)

use tracing::info;

use boardwatch::config::Config;
use boardwatch::storage::mongodb::{connect, migrate_single_to_split};
use boardwatch::utils::bootstrap::init_tracing;
use boardwatch::utils::retry::with_storage_retry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let mongodb = &config.storage.mongodb;

    info!(database = %mongodb.database, "boardwatch-migrate started");

    let client = with_storage_retry(|| connect(mongodb)).await?;
    let report =
        migrate_single_to_split(&client, &mongodb.database, mongodb.index_timeout()).await?;

    info!(
        boards = report.boards,
        subscriptions = report.subscriptions,
        "boardwatch-migrate finished"
    );
    Ok(())
}
