//! Message types for the Parley protocol.
//!
//! Messages are the fundamental unit of communication in Parley.
//! Each message is a flat JSON object whose `type` field selects its kind;
//! the remaining fields are optional and omitted when absent.

use serde::{Deserialize, Serialize};

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A chat line sent to a room.
    ChatMessage,
    /// A user joined the room.
    UserJoined,
    /// A user left the room.
    UserLeft,
    /// Typing indicator (reserved).
    Typing,
    /// Presence status change (reserved).
    StatusUpdate,
}

impl MessageKind {
    /// Get the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ChatMessage => "chat_message",
            MessageKind::UserJoined => "user_joined",
            MessageKind::UserLeft => "user_left",
            MessageKind::Typing => "typing",
            MessageKind::StatusUpdate => "status_update",
        }
    }

    /// Whether the server acts on this kind when a client sends it.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        matches!(self, MessageKind::ChatMessage)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message.
///
/// The same shape is used in both directions. Clients send `chat_message`;
/// the server broadcasts `chat_message`, `user_joined` and `user_left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message kind, serialized as `type`.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Room the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    /// Display name of the user the message is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Free-form structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WireMessage {
    /// Create an empty message of the given kind.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            room_id: None,
            username: None,
            content: None,
            data: None,
        }
    }

    /// Create a chat message.
    #[must_use]
    pub fn chat(
        room_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::ChatMessage,
            room_id: Some(room_id.into()),
            username: Some(username.into()),
            content: Some(content.into()),
            data: None,
        }
    }

    /// Create a `user_joined` notice.
    #[must_use]
    pub fn user_joined(room_id: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            kind: MessageKind::UserJoined,
            room_id: Some(room_id.into()),
            content: Some(format!("{} joined the room", username)),
            username: Some(username),
            data: None,
        }
    }

    /// Create a `user_left` notice.
    #[must_use]
    pub fn user_left(room_id: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            kind: MessageKind::UserLeft,
            room_id: Some(room_id.into()),
            content: Some(format!("{} left the room", username)),
            username: Some(username),
            data: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Get the content, or an empty string.
    #[must_use]
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}
