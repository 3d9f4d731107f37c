//! boardwatch - board subscription registry
//!
//! Tracks which chats are subscribed to which boards, and a per-board
//! watermark so content that was already seen is not delivered again.
//! Storage is MongoDB (single-collection or split layout) or in-memory.

pub mod config;
pub mod registry;
pub mod storage;
pub mod utils;

pub use registry::Registry;
pub use storage::{Board, ChatId, StorageError, SubscriptionStore, Timestamp};
