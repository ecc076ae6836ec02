//! Persistence collaborator for Parley.
//!
//! The hub never owns durable state. It persists chat messages, looks up
//! presence and lists rooms through [`PersistStore`], which every session
//! shares and which must therefore be safe for concurrent use.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::message::ChatMessage;
use crate::presence::{now_millis, PresenceStatus, UserId, UserPresence};
use crate::room::{RoomId, RoomInfo};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No presence record exists for the user.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// A room with the same id already exists.
    #[error("Room already exists: {0}")]
    RoomExists(RoomId),

    /// The backend could not serve the request.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage used by the hub and the presence service.
#[async_trait]
pub trait PersistStore: Send + Sync {
    /// Persist a chat message.
    async fn save_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Load a user's presence record.
    async fn get_presence(&self, user_id: &str) -> Result<UserPresence, StoreError>;

    /// Insert or replace a user's presence record.
    async fn put_presence(&self, presence: &UserPresence) -> Result<(), StoreError>;

    /// Get a user's stored status.
    async fn get_user_status(&self, user_id: &str) -> Result<PresenceStatus, StoreError> {
        Ok(self.get_presence(user_id).await?.status)
    }

    /// List rooms, oldest first.
    async fn list_rooms(&self) -> Result<Vec<RoomInfo>, StoreError>;

    /// Create a room.
    async fn create_room(&self, name: &str, description: &str) -> Result<RoomInfo, StoreError>;

    /// Hand a message to a user's offline mailbox.
    async fn store_for_later(&self, user_id: &str, message: &ChatMessage) -> Result<(), StoreError>;
}

/// In-process store backed by concurrent maps.
///
/// Used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<Vec<RoomInfo>>,
    messages: DashMap<RoomId, Vec<ChatMessage>>,
    presence: DashMap<UserId, UserPresence>,
    mailboxes: DashMap<UserId, Vec<ChatMessage>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with rooms whose ids equal their names.
    #[must_use]
    pub fn with_rooms<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = now_millis();
        let rooms = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                RoomInfo {
                    id: name.clone(),
                    description: format!("{} chat room", name),
                    name,
                    created_at: now,
                }
            })
            .collect();

        Self {
            rooms: RwLock::new(rooms),
            ..Self::default()
        }
    }

    /// Insert a presence record directly.
    pub fn insert_presence(&self, presence: UserPresence) {
        self.presence.insert(presence.user_id.clone(), presence);
    }

    /// Make every write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Get the messages persisted for a room.
    #[must_use]
    pub fn messages(&self, room_id: &str) -> Vec<ChatMessage> {
        self.messages
            .get(room_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Get the messages waiting in a user's offline mailbox.
    #[must_use]
    pub fn mailbox(&self, user_id: &str) -> Vec<ChatMessage> {
        self.mailboxes
            .get(user_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistStore for MemoryStore {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.check_writable()?;
        self.messages
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        trace!(room = %message.room_id, id = message.id, "Message saved");
        Ok(())
    }

    async fn get_presence(&self, user_id: &str) -> Result<UserPresence, StoreError> {
        self.presence
            .get(user_id)
            .map(|p| p.clone())
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    async fn put_presence(&self, presence: &UserPresence) -> Result<(), StoreError> {
        self.check_writable()?;
        self.presence
            .insert(presence.user_id.clone(), presence.clone());
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<RoomInfo>, StoreError> {
        Ok(self.rooms.read().await.clone())
    }

    async fn create_room(&self, name: &str, description: &str) -> Result<RoomInfo, StoreError> {
        self.check_writable()?;
        let mut rooms = self.rooms.write().await;
        if rooms.iter().any(|r| r.id == name) {
            return Err(StoreError::RoomExists(name.to_string()));
        }

        let room = RoomInfo {
            id: name.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now_millis(),
        };
        rooms.push(room.clone());
        debug!(room = %room.id, "Room created");
        Ok(room)
    }

    async fn store_for_later(&self, user_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        self.check_writable()?;
        self.mailboxes
            .entry(user_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}
