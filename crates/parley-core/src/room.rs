//! Room abstraction for Parley.
//!
//! A room is a named group of live sessions. It has no storage of its own:
//! it exists in the hub's index while at least one session is assigned to
//! it, and is created implicitly by the first join.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::session::SessionId;

/// Maximum room identifier length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Room used when a client names none and the store lists none.
pub const FALLBACK_ROOM: &str = "general";

/// A room identifier.
pub type RoomId = String;

/// Validate a room identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("Room id contains control characters");
    }
    Ok(())
}

/// Stored description of a room, as listed by the persistence store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room identifier.
    pub id: RoomId,
    /// Display name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Live membership of one room.
#[derive(Debug)]
pub struct Room {
    /// Room identifier.
    id: RoomId,
    /// Sessions currently assigned to the room.
    members: HashSet<SessionId>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: HashSet::new(),
        }
    }

    /// Get the room identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a session is a member.
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains(session_id)
    }

    /// Add a session.
    ///
    /// Returns `true` if the session was not already a member.
    pub fn join(&mut self, session_id: SessionId) -> bool {
        debug!(room = %self.id, session = %session_id, "Session joined room");
        self.members.insert(session_id)
    }

    /// Remove a session.
    ///
    /// Returns `true` if the session was a member.
    pub fn leave(&mut self, session_id: &SessionId) -> bool {
        let removed = self.members.remove(session_id);
        if removed {
            debug!(room = %self.id, session = %session_id, "Session left room");
        }
        removed
    }

    /// Iterate over member session IDs.
    pub fn members(&self) -> impl Iterator<Item = &SessionId> {
        self.members.iter()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
