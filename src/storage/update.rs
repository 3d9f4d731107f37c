//! Typed update intents.
//!
//! Every mutation the registry performs is described as a [`BoardUpdate`]
//! aimed at a [`BoardTarget`]. Store implementations translate the intent
//! into a single atomic request against their backend.

use super::{Board, ChatId, Timestamp};

/// Which boards an update applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardTarget {
    /// Exactly one board, matched by name.
    Named(String),
    /// Every board. Never upserts.
    All,
}

impl BoardTarget {
    /// Map a possibly empty board name: empty means every board.
    pub fn from_name(board_name: &str) -> Self {
        if board_name.is_empty() {
            BoardTarget::All
        } else {
            BoardTarget::Named(board_name.to_string())
        }
    }
}

/// Change to a board's subscriber set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Set insertion: adding an existing member is a no-op.
    AddChat(ChatId),
    /// Removing a non-member is a no-op.
    RemoveChat(ChatId),
}

/// Change to a board's watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkUpdate {
    /// Overwrite unconditionally.
    Set(Timestamp),
    /// Only applies when the update creates the board.
    SetOnInsert(Timestamp),
}

/// A single atomic modification of one or more boards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardUpdate {
    pub membership: Option<Membership>,
    pub watermark: Option<WatermarkUpdate>,
    /// Create the board when a named target does not exist yet.
    pub upsert: bool,
    /// Registry operation the update belongs to, reported on failure.
    pub operation: &'static str,
}

impl BoardUpdate {
    /// Add `chat_id`, creating the board with `initial_watermark` if needed.
    pub fn subscribe(chat_id: ChatId, initial_watermark: Timestamp) -> Self {
        Self {
            membership: Some(Membership::AddChat(chat_id)),
            watermark: Some(WatermarkUpdate::SetOnInsert(initial_watermark)),
            upsert: true,
            operation: "subscribe_chat",
        }
    }

    /// Remove `chat_id` from matching boards; never creates anything.
    pub fn unsubscribe(chat_id: ChatId) -> Self {
        Self {
            membership: Some(Membership::RemoveChat(chat_id)),
            watermark: None,
            upsert: false,
            operation: "unsubscribe_chat",
        }
    }

    /// Overwrite the watermark, creating an empty board if needed.
    pub fn set_watermark(timestamp: Timestamp) -> Self {
        Self {
            membership: None,
            watermark: Some(WatermarkUpdate::Set(timestamp)),
            upsert: true,
            operation: "update_board_timestamp",
        }
    }

    pub fn is_empty(&self) -> bool {
        self.membership.is_none() && self.watermark.is_none() && !self.upsert
    }

    /// Watermark a freshly inserted board starts with.
    pub fn insert_watermark(&self) -> Timestamp {
        match self.watermark {
            Some(WatermarkUpdate::Set(ts)) | Some(WatermarkUpdate::SetOnInsert(ts)) => ts,
            None => 0,
        }
    }

    /// Build the board this update would insert.
    pub fn seed(&self, board_name: &str) -> Board {
        let mut board = Board::empty(board_name, self.insert_watermark());
        self.apply_to(&mut board, true);
        board
    }

    /// Apply the update to an in-memory board.
    ///
    /// `inserted` tells whether the board was created by this update, which
    /// decides whether set-on-insert directives take effect.
    pub fn apply_to(&self, board: &mut Board, inserted: bool) {
        match self.membership {
            Some(Membership::AddChat(chat_id)) => {
                board.subscribers.insert(chat_id);
            }
            Some(Membership::RemoveChat(chat_id)) => {
                board.subscribers.remove(&chat_id);
            }
            None => {}
        }

        match self.watermark {
            Some(WatermarkUpdate::Set(ts)) => board.watermark = ts,
            Some(WatermarkUpdate::SetOnInsert(ts)) if inserted => board.watermark = ts,
            _ => {}
        }
    }
}
