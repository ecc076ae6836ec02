//! Presence service.
//!
//! Applies the presence state machine to the records held by the
//! persistence store. There is no in-process cache: every call reads the
//! store, and inactivity decay is applied lazily whenever a record is read.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::delivery::StatusLookup;
use crate::presence::{
    now_millis, validate_transition, Action, PresenceError, PresenceStatus, UserId, UserPresence,
    DEFAULT_AUTO_AWAY_TIMEOUT,
};
use crate::store::{PersistStore, StoreError};

/// Presence operations over a [`PersistStore`].
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn PersistStore>,
    auto_away_timeout: Duration,
}

impl PresenceService {
    /// Create a service with the default auto-away timeout.
    pub fn new(store: Arc<dyn PersistStore>) -> Self {
        Self {
            store,
            auto_away_timeout: DEFAULT_AUTO_AWAY_TIMEOUT,
        }
    }

    /// Override the inactivity period after which `Online` decays to `Away`.
    #[must_use]
    pub fn with_auto_away_timeout(mut self, timeout: Duration) -> Self {
        self.auto_away_timeout = timeout;
        self
    }

    /// Get the auto-away timeout.
    #[must_use]
    pub fn auto_away_timeout(&self) -> Duration {
        self.auto_away_timeout
    }

    /// Load a user's presence, applying inactivity decay.
    ///
    /// A decayed record is written back; a failed write is logged and the
    /// decayed record is still returned.
    pub async fn presence(&self, user_id: &str) -> Result<UserPresence, PresenceError> {
        let mut presence = self.store.get_presence(user_id).await?;

        if presence.apply_auto_away(now_millis(), self.auto_away_timeout) {
            info!(user = %user_id, "User marked away after inactivity");
            if let Err(e) = self.store.put_presence(&presence).await {
                warn!(user = %user_id, error = %e, "Failed to persist auto-away");
            }
        }

        Ok(presence)
    }

    /// Resolve a user's effective status.
    pub async fn resolve(&self, user_id: &str) -> Result<PresenceStatus, PresenceError> {
        Ok(self.presence(user_id).await?.status)
    }

    /// Load a user's presence, creating an `Online` record if none exists.
    pub async fn ensure(&self, user_id: &str) -> Result<UserPresence, PresenceError> {
        match self.presence(user_id).await {
            Ok(presence) => Ok(presence),
            Err(PresenceError::Store(StoreError::UserNotFound(_))) => {
                let presence = UserPresence::new(user_id, PresenceStatus::default());
                self.store.put_presence(&presence).await?;
                debug!(user = %user_id, "Presence record created");
                Ok(presence)
            }
            Err(e) => Err(e),
        }
    }

    /// Record activity by a user.
    ///
    /// Refreshes the activity timestamp. A user who had decayed to `Away`
    /// returns to `Online`; a user who chose `Away` stays there. Unknown
    /// users are not created.
    pub async fn record_activity(&self, user_id: &str) -> Result<UserPresence, PresenceError> {
        let mut presence = self.presence(user_id).await?;

        if presence.record_activity(now_millis()) {
            info!(user = %user_id, "User back online");
        }
        self.store.put_presence(&presence).await?;

        Ok(presence)
    }

    /// Set a user's status on their behalf.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::InvalidStatus`] if `raw_status` is not a
    /// known status.
    pub async fn set_status(
        &self,
        user_id: &str,
        raw_status: &str,
        custom_message: Option<String>,
    ) -> Result<UserPresence, PresenceError> {
        let mut presence = self.ensure(user_id).await?;
        let (from, to) = validate_transition(presence.status.as_str(), raw_status)?;

        presence.set_status(to, custom_message, now_millis());
        self.store.put_presence(&presence).await?;

        info!(user = %user_id, %from, %to, "Status changed");
        Ok(presence)
    }

    /// Check that a user's current status permits `action`.
    ///
    /// Returns the status the check was made against. Users whose status
    /// cannot be resolved are refused.
    pub async fn check_action(
        &self,
        user_id: &str,
        action: Action,
    ) -> Result<PresenceStatus, PresenceError> {
        let status = self.resolve(user_id).await?;
        if !status.can(action) {
            return Err(PresenceError::ActionNotAllowed { status, action });
        }
        Ok(status)
    }

    /// Check that a user may post messages.
    pub async fn can_send(&self, user_id: &str) -> Result<PresenceStatus, PresenceError> {
        self.check_action(user_id, Action::SendMessages).await
    }

    /// Check that a user may join rooms.
    pub async fn can_join(&self, user_id: &str) -> Result<PresenceStatus, PresenceError> {
        self.check_action(user_id, Action::JoinRooms).await
    }

    /// Keep the users whose status is one of `allowed`.
    ///
    /// Users that cannot be resolved are skipped.
    pub async fn filter_by_status(
        &self,
        users: &[UserId],
        allowed: &[PresenceStatus],
    ) -> Vec<UserId> {
        let mut kept = Vec::with_capacity(users.len());
        for user in users {
            match self.resolve(user).await {
                Ok(status) if allowed.contains(&status) => kept.push(user.clone()),
                Ok(_) => {}
                Err(e) => debug!(user = %user, error = %e, "Skipping unresolved user"),
            }
        }
        kept
    }
}

#[async_trait]
impl StatusLookup for PresenceService {
    async fn status_of(&self, user_id: &str) -> Result<PresenceStatus, PresenceError> {
        self.resolve(user_id).await
    }
}
