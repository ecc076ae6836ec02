//! Chat message pipeline.
//!
//! Runs on the sending session's task, so store and presence I/O never
//! stall the hub loop. Each inbound chat line is checked against the
//! sender's presence, persisted, routed per recipient and finally
//! submitted to the hub as a single annotated broadcast.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use parley_protocol::{encode, WireMessage};

use crate::delivery::{route, DeliveryPolicy, DeliveryResult, StatusAwareMessage};
use crate::hub::{HubError, HubHandle, MemberInfo};
use crate::message::ChatMessage;
use crate::presence::{PresenceError, PresenceStatus, UserId};
use crate::status::PresenceService;
use crate::store::{PersistStore, StoreError};

/// What happened to a chat line.
#[derive(Debug)]
pub enum ChatOutcome {
    /// Broadcast to the room, routed as described.
    Delivered(DeliveryResult),
    /// Dropped because the sender may not post.
    Refused(PresenceError),
}

/// Handles `chat_message` events from sessions.
pub struct ChatPipeline {
    store: Arc<dyn PersistStore>,
    presence: PresenceService,
    policy: DeliveryPolicy,
    hub: HubHandle,
}

impl ChatPipeline {
    /// Create a pipeline.
    pub fn new(
        store: Arc<dyn PersistStore>,
        presence: PresenceService,
        policy: DeliveryPolicy,
        hub: HubHandle,
    ) -> Self {
        Self {
            store,
            presence,
            policy,
            hub,
        }
    }

    /// Process one chat line from `sender`.
    ///
    /// Senders without a user id are treated as `Online`. Senders with a
    /// user id but no presence record are refused. Refusals and store
    /// failures are not errors; only a stopped hub is.
    pub async fn handle(&self, sender: &MemberInfo, content: String) -> Result<ChatOutcome, HubError> {
        let sender_status = match &sender.user_id {
            None => PresenceStatus::Online,
            Some(user_id) => {
                match self.presence.record_activity(user_id).await {
                    Ok(_) | Err(PresenceError::Store(StoreError::UserNotFound(_))) => {}
                    Err(e) => warn!(user = %user_id, error = %e, "Failed to record activity"),
                }
                match self.presence.can_send(user_id).await {
                    Ok(status) => status,
                    Err(e) => {
                        debug!(user = %user_id, error = %e, "Dropping message");
                        return Ok(ChatOutcome::Refused(e));
                    }
                }
            }
        };

        let message = ChatMessage::new(&sender.room_id, &sender.username, content)
            .with_user(sender.user_id.clone());
        if let Err(e) = self.store.save_message(&message).await {
            error!(room = %message.room_id, error = %e, "Failed to persist message");
        }

        let recipients = self.recipients(sender).await?;
        let aware = StatusAwareMessage::new(
            sender.user_id.clone(),
            &sender.room_id,
            &message.content,
            sender_status,
            &self.policy,
        );
        let delivery = route(&aware, &recipients, &self.presence).await;

        for user_id in &delivery.stored {
            if let Err(e) = self.store.store_for_later(user_id, &message).await {
                error!(user = %user_id, error = %e, "Failed to store message for later");
            }
        }

        let frame = WireMessage::chat(&sender.room_id, &sender.username, &message.content)
            .with_data(aware.annotation(&delivery));
        match encode(&frame) {
            Ok(payload) => self.hub.broadcast(sender.room_id.clone(), payload).await?,
            Err(e) => error!(error = %e, "Failed to encode chat message"),
        }

        trace!(room = %sender.room_id, stats = ?delivery.stats(), "Chat message routed");
        Ok(ChatOutcome::Delivered(delivery))
    }

    /// Authenticated users in the sender's room, other than the sender.
    async fn recipients(&self, sender: &MemberInfo) -> Result<Vec<UserId>, HubError> {
        let members = self.hub.room_members(sender.room_id.clone()).await?;

        let mut recipients: Vec<UserId> = Vec::with_capacity(members.len());
        for user_id in members.into_iter().filter_map(|m| m.user_id) {
            if Some(&user_id) != sender.user_id.as_ref() && !recipients.contains(&user_id) {
                recipients.push(user_id);
            }
        }
        Ok(recipients)
    }
}
