//! Stored chat messages.
//!
//! The record handed to the persistence store for every chat line, and to the
//! offline mailbox of recipients who are away.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::presence::{now_millis, UserId};
use crate::room::RoomId;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Timestamp in the upper bits, counter in the lower 20.
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (now_millis() << 20) | (counter & 0xF_FFFF)
}

/// Message content type for ordinary chat text.
pub const TEXT_KIND: &str = "text";

/// A chat message as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Room the message was sent to.
    pub room_id: RoomId,
    /// Authenticated sender, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Sender display name.
    pub username: String,
    /// Text content.
    pub content: String,
    /// Content type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl ChatMessage {
    /// Create a text message stamped now.
    #[must_use]
    pub fn new(
        room_id: impl Into<RoomId>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            room_id: room_id.into(),
            user_id: None,
            username: username.into(),
            content: content.into(),
            kind: TEXT_KIND.to_string(),
            created_at: now_millis(),
        }
    }

    /// Attribute the message to an authenticated user.
    #[must_use]
    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }
}
