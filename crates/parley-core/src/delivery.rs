//! Delivery policy engine.
//!
//! Decides, per outgoing message, how each recipient should be reached
//! given the sender's and the recipient's presence. Results are computed
//! fresh for every message and never cached.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use crate::presence::{Action, PresenceError, PresenceStatus, UserId};
use crate::room::RoomId;

/// Priority at or above which a message interrupts a busy recipient.
pub const URGENT_PRIORITY: u8 = 3;

/// How a message from a given sender should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryRules {
    /// Show a popup to every recipient that accepts popups.
    pub show_popup_to_all: bool,
    /// Message priority (higher = more urgent).
    pub priority_level: u8,
}

/// Tunables for [`DeliveryPolicy::rules_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Treat messages from busy senders as urgent interruptions.
    ///
    /// On by default, so a busy sender's message pops up for every
    /// recipient that accepts popups, busy recipients included. When
    /// disabled, busy senders keep the elevated priority but their messages
    /// never raise popups, which matches the quieter "no popups from busy
    /// senders" reading of the delivery rules.
    pub escalate_busy_senders: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            escalate_busy_senders: true,
        }
    }
}

impl DeliveryPolicy {
    /// Compute the delivery rules for a sender's status.
    #[must_use]
    pub fn rules_for(&self, sender: PresenceStatus) -> DeliveryRules {
        match sender {
            PresenceStatus::Online => DeliveryRules {
                show_popup_to_all: true,
                priority_level: 2,
            },
            PresenceStatus::Busy => DeliveryRules {
                show_popup_to_all: self.escalate_busy_senders,
                priority_level: URGENT_PRIORITY,
            },
            PresenceStatus::Away => DeliveryRules {
                show_popup_to_all: false,
                priority_level: 1,
            },
        }
    }
}

/// Compute the delivery rules for a sender's status under the default policy.
#[must_use]
pub fn delivery_rules_for(sender: PresenceStatus) -> DeliveryRules {
    DeliveryPolicy::default().rules_for(sender)
}

/// A chat message together with its sender's presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusAwareMessage {
    /// Authenticated sender, if any.
    pub from_user: Option<UserId>,
    /// Target room.
    pub room: RoomId,
    /// Text content.
    pub content: String,
    /// Sender's status when the message was sent.
    pub sender_status: PresenceStatus,
    /// Rules derived from the sender's status.
    pub rules: DeliveryRules,
    /// Recipients are expected to acknowledge the message.
    pub requires_ack: bool,
}

impl StatusAwareMessage {
    /// Wrap a message, deriving rules from the sender's status.
    #[must_use]
    pub fn new(
        from_user: Option<UserId>,
        room: impl Into<RoomId>,
        content: impl Into<String>,
        sender_status: PresenceStatus,
        policy: &DeliveryPolicy,
    ) -> Self {
        Self {
            from_user,
            room: room.into(),
            content: content.into(),
            sender_status,
            rules: policy.rules_for(sender_status),
            requires_ack: sender_status == PresenceStatus::Busy,
        }
    }

    /// Build the annotation attached to the broadcast frame.
    #[must_use]
    pub fn annotation(&self, result: &DeliveryResult) -> serde_json::Value {
        json!({
            "sender_status": self.sender_status,
            "priority": self.rules.priority_level,
            "requires_ack": self.requires_ack,
            "popup": result.popup,
        })
    }
}

/// Partition of a message's recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    /// Online recipients.
    pub online: Vec<UserId>,
    /// Away recipients.
    pub away: Vec<UserId>,
    /// Busy recipients.
    pub busy: Vec<UserId>,
    /// Recipients who should see a popup.
    pub popup: Vec<UserId>,
    /// Recipients whose copy goes to the offline mailbox.
    pub stored: Vec<UserId>,
    /// Recipients whose status could not be resolved.
    pub blocked: Vec<UserId>,
}

/// Bucket sizes of a [`DeliveryResult`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub total: usize,
    pub online: usize,
    pub away: usize,
    pub busy: usize,
    pub popup: usize,
    pub stored: usize,
    pub blocked: usize,
}

impl DeliveryResult {
    /// Count recipients per bucket.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            total: self.online.len() + self.away.len() + self.busy.len(),
            online: self.online.len(),
            away: self.away.len(),
            busy: self.busy.len(),
            popup: self.popup.len(),
            stored: self.stored.len(),
            blocked: self.blocked.len(),
        }
    }
}

/// Source of current presence for routing.
#[async_trait]
pub trait StatusLookup: Send + Sync {
    /// Resolve a user's current status.
    async fn status_of(&self, user_id: &str) -> Result<PresenceStatus, PresenceError>;
}

#[async_trait]
impl StatusLookup for HashMap<UserId, PresenceStatus> {
    async fn status_of(&self, user_id: &str) -> Result<PresenceStatus, PresenceError> {
        self.get(user_id)
            .copied()
            .ok_or_else(|| PresenceError::UnknownStatus(user_id.to_string()))
    }
}

/// Route a message to its recipients.
///
/// One lookup per recipient. A failed lookup blocks that recipient only.
pub async fn route<L>(message: &StatusAwareMessage, recipients: &[UserId], lookup: &L) -> DeliveryResult
where
    L: StatusLookup + ?Sized,
{
    let rules = message.rules;
    let mut result = DeliveryResult::default();

    for recipient in recipients {
        let status = match lookup.status_of(recipient).await {
            Ok(status) => status,
            Err(e) => {
                debug!(user = %recipient, error = %e, "Recipient blocked");
                result.blocked.push(recipient.clone());
                continue;
            }
        };

        match status {
            PresenceStatus::Online => {
                result.online.push(recipient.clone());
                if rules.show_popup_to_all && status.can(Action::ReceivePopups) {
                    result.popup.push(recipient.clone());
                }
            }
            PresenceStatus::Away => {
                result.away.push(recipient.clone());
                result.stored.push(recipient.clone());
            }
            PresenceStatus::Busy => {
                result.busy.push(recipient.clone());
                if rules.show_popup_to_all && rules.priority_level >= URGENT_PRIORITY {
                    result.popup.push(recipient.clone());
                }
            }
        }
    }

    result
}
