//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Mongodb,
    /// In-process store; state is lost on restart.
    Memory,
}

/// Physical layout of the subscription data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaLayout {
    /// One `boards` collection holding name, subscriber set and watermark.
    #[default]
    Single,
    /// Subscription pairs, board descriptions and failed chats in separate
    /// collections.
    Split,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Schema layout used by the MongoDB adapter.
    pub layout: SchemaLayout,
    /// MongoDB-specific configuration.
    pub mongodb: MongodbConfig,
}

/// MongoDB-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongodbConfig {
    /// MongoDB connection URI.
    pub uri: String,
    /// Database name.
    pub database: String,
    /// Server selection timeout used when connecting.
    pub connect_timeout_secs: u64,
    /// Upper bound for creating indexes at startup.
    pub index_timeout_secs: u64,
}

impl MongodbConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_secs)
    }
}

impl Default for MongodbConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "boardwatch".to_string(),
            connect_timeout_secs: 5,
            index_timeout_secs: 30,
        }
    }
}
