//! Presence state machine for Parley.
//!
//! A user's availability is one of three statuses. Each status maps to a
//! fixed row of the capability table, which decides what the user may do and
//! how messages reach them. The functions here are pure; the
//! [`status`](crate::status) module applies them to stored records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::store::StoreError;

/// A user identifier, as issued by the identity layer.
pub type UserId = String;

/// Default inactivity period after which an `Online` user becomes `Away`.
pub const DEFAULT_AUTO_AWAY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Not one of `online`, `away`, `busy`.
    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    /// Not one of the known capability names.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A transition endpoint is not a valid status.
    #[error("Invalid {endpoint} status: {value}")]
    InvalidStatus {
        /// `"source"` or `"target"`.
        endpoint: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The user's current status forbids the action.
    #[error("Cannot {action} while {status}")]
    ActionNotAllowed {
        /// Status at the time of the check.
        status: PresenceStatus,
        /// The forbidden action.
        action: Action,
    },

    /// The user's presence could not be loaded or saved.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A user's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Available and ready to chat. The default for new users.
    #[default]
    Online,
    /// Temporarily unavailable.
    Away,
    /// Occupied and may not respond immediately.
    Busy,
}

impl PresenceStatus {
    /// Every status, in table order.
    pub const ALL: [PresenceStatus; 3] = [
        PresenceStatus::Online,
        PresenceStatus::Away,
        PresenceStatus::Busy,
    ];

    /// Get the wire name of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
        }
    }

    /// Get the capability table row for this status.
    #[must_use]
    pub fn info(&self) -> &'static StatusInfo {
        match self {
            PresenceStatus::Online => &ONLINE,
            PresenceStatus::Away => &AWAY,
            PresenceStatus::Busy => &BUSY,
        }
    }

    /// Relative urgency of this status (higher = more urgent).
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.info().priority
    }

    /// Check whether a user with this status may perform `action`.
    #[must_use]
    pub fn can(&self, action: Action) -> bool {
        can_perform(*self, action)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            other => Err(PresenceError::UnknownStatus(other.to_string())),
        }
    }
}

/// A capability that depends on presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Post chat messages.
    SendMessages,
    /// Join rooms.
    JoinRooms,
    /// Receive chat messages.
    ReceiveMessages,
    /// Receive notifications.
    ReceiveNotifications,
    /// Receive popup notifications.
    ReceivePopups,
}

impl Action {
    /// Get the wire name of this action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SendMessages => "send_messages",
            Action::JoinRooms => "join_rooms",
            Action::ReceiveMessages => "receive_messages",
            Action::ReceiveNotifications => "receive_notifications",
            Action::ReceivePopups => "receive_popups",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human form for error messages: "send messages".
        f.write_str(&self.as_str().replace('_', " "))
    }
}

impl FromStr for Action {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_messages" => Ok(Action::SendMessages),
            "join_rooms" => Ok(Action::JoinRooms),
            "receive_messages" => Ok(Action::ReceiveMessages),
            "receive_notifications" => Ok(Action::ReceiveNotifications),
            "receive_popups" => Ok(Action::ReceivePopups),
            other => Err(PresenceError::UnknownAction(other.to_string())),
        }
    }
}

/// A row of the capability table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    /// The status this row describes.
    pub status: PresenceStatus,
    /// Human-readable name.
    pub display_name: &'static str,
    /// Short description.
    pub description: &'static str,
    /// Icon shown next to the user.
    pub icon: &'static str,
    /// May receive chat messages.
    pub can_receive_messages: bool,
    /// May post chat messages.
    pub can_send_messages: bool,
    /// May join rooms.
    pub can_join_rooms: bool,
    /// May receive notifications.
    pub can_receive_notifications: bool,
    /// May receive popup notifications.
    pub can_receive_popups: bool,
    /// Inactivity period after which the status decays to `Away`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_away_timeout_secs: Option<u64>,
    /// Relative urgency (higher = more urgent).
    pub priority: u8,
}

impl StatusInfo {
    /// Get the auto-away timeout as a duration.
    #[must_use]
    pub fn auto_away_timeout(&self) -> Option<Duration> {
        self.auto_away_timeout_secs.map(Duration::from_secs)
    }
}

static ONLINE: StatusInfo = StatusInfo {
    status: PresenceStatus::Online,
    display_name: "Online",
    description: "Available and ready to chat",
    icon: "🟢",
    can_receive_messages: true,
    can_send_messages: true,
    can_join_rooms: true,
    can_receive_notifications: true,
    can_receive_popups: true,
    auto_away_timeout_secs: Some(DEFAULT_AUTO_AWAY_TIMEOUT.as_secs()),
    priority: 3,
};

static AWAY: StatusInfo = StatusInfo {
    status: PresenceStatus::Away,
    display_name: "Away",
    description: "Temporarily unavailable",
    icon: "🟡",
    can_receive_messages: true,
    can_send_messages: false,
    can_join_rooms: false,
    can_receive_notifications: false,
    can_receive_popups: false,
    auto_away_timeout_secs: None,
    priority: 1,
};

static BUSY: StatusInfo = StatusInfo {
    status: PresenceStatus::Busy,
    display_name: "Busy",
    description: "Occupied and may not respond immediately",
    icon: "🔴",
    can_receive_messages: true,
    can_send_messages: true,
    can_join_rooms: true,
    can_receive_notifications: true,
    can_receive_popups: false,
    auto_away_timeout_secs: None,
    priority: 2,
};

/// Check whether a raw status string is one of the known statuses.
#[must_use]
pub fn is_valid(raw: &str) -> bool {
    raw.parse::<PresenceStatus>().is_ok()
}

/// Look up the capability row for a raw status string.
///
/// # Errors
///
/// Returns [`PresenceError::UnknownStatus`] if `raw` is not a known status.
pub fn capabilities(raw: &str) -> Result<&'static StatusInfo, PresenceError> {
    Ok(raw.parse::<PresenceStatus>()?.info())
}

/// Check whether `status` permits `action`.
#[must_use]
pub fn can_perform(status: PresenceStatus, action: Action) -> bool {
    let info = status.info();
    match action {
        Action::SendMessages => info.can_send_messages,
        Action::JoinRooms => info.can_join_rooms,
        Action::ReceiveMessages => info.can_receive_messages,
        Action::ReceiveNotifications => info.can_receive_notifications,
        Action::ReceivePopups => info.can_receive_popups,
    }
}

/// Check a capability by name. Unknown statuses or actions yield `false`.
#[must_use]
pub fn can_perform_named(raw_status: &str, raw_action: &str) -> bool {
    match (raw_status.parse::<PresenceStatus>(), raw_action.parse::<Action>()) {
        (Ok(status), Ok(action)) => can_perform(status, action),
        _ => false,
    }
}

/// Validate a status change.
///
/// Every change between valid statuses is currently allowed.
///
/// # Errors
///
/// Returns [`PresenceError::InvalidStatus`] naming the first invalid endpoint.
pub fn validate_transition(
    from: &str,
    to: &str,
) -> Result<(PresenceStatus, PresenceStatus), PresenceError> {
    let from = from.parse().map_err(|_| PresenceError::InvalidStatus {
        endpoint: "source",
        value: from.to_string(),
    })?;
    let to = to.parse().map_err(|_| PresenceError::InvalidStatus {
        endpoint: "target",
        value: to.to_string(),
    })?;
    Ok((from, to))
}

/// Decide whether inactivity should move a user to `Away`.
///
/// Returns `(true, Away)` only if `current` is `Online` and more than
/// `timeout` has elapsed since `last_activity_ms`; otherwise
/// `(false, current)`. Timestamps are milliseconds since the Unix epoch.
#[must_use]
pub fn check_auto_transition(
    last_activity_ms: u64,
    current: PresenceStatus,
    now_ms: u64,
    timeout: Duration,
) -> (bool, PresenceStatus) {
    let idle_ms = now_ms.saturating_sub(last_activity_ms);
    if current == PresenceStatus::Online && u128::from(idle_ms) > timeout.as_millis() {
        (true, PresenceStatus::Away)
    } else {
        (false, current)
    }
}

/// Returns `true` if `a` is more urgent than `b`.
#[must_use]
pub fn compare(a: PresenceStatus, b: PresenceStatus) -> bool {
    a.priority() > b.priority()
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A user's stored presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    /// The user this record belongs to.
    pub user_id: UserId,
    /// Current status.
    pub status: PresenceStatus,
    /// Optional free-text status message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    /// When the status was last set.
    pub set_at: u64,
    /// Last recorded activity.
    pub last_activity: u64,
    /// True if the status was set by auto-away rather than by the user.
    pub auto_set: bool,
}

impl UserPresence {
    /// Create a record with the given status, stamped now.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, status: PresenceStatus) -> Self {
        Self::at(user_id, status, now_millis())
    }

    /// Create a record with the given status, stamped at `now_ms`.
    #[must_use]
    pub fn at(user_id: impl Into<UserId>, status: PresenceStatus, now_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            custom_message: None,
            set_at: now_ms,
            last_activity: now_ms,
            auto_set: false,
        }
    }

    /// Attach a custom status message.
    #[must_use]
    pub fn with_custom_message(mut self, message: impl Into<String>) -> Self {
        self.custom_message = Some(message.into());
        self
    }

    /// Record activity. An auto-set `Away` returns to `Online`.
    ///
    /// Returns `true` if the status changed.
    pub fn record_activity(&mut self, now_ms: u64) -> bool {
        self.last_activity = now_ms;

        if self.auto_set && self.status == PresenceStatus::Away {
            self.status = PresenceStatus::Online;
            self.auto_set = false;
            self.set_at = now_ms;
            return true;
        }
        false
    }

    /// Apply inactivity decay.
    ///
    /// Returns `true` if the status changed.
    pub fn apply_auto_away(&mut self, now_ms: u64, timeout: Duration) -> bool {
        let (should_change, next) =
            check_auto_transition(self.last_activity, self.status, now_ms, timeout);
        if should_change {
            self.status = next;
            self.auto_set = true;
            self.set_at = now_ms;
        }
        should_change
    }

    /// Set the status explicitly on the user's behalf.
    pub fn set_status(&mut self, status: PresenceStatus, custom_message: Option<String>, now_ms: u64) {
        self.status = status;
        self.custom_message = custom_message;
        self.auto_set = false;
        self.set_at = now_ms;
        self.last_activity = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: u64 = 60_000;

    #[test]
    fn test_status_parsing_is_strict() {
        assert_eq!("online".parse::<PresenceStatus>().unwrap(), PresenceStatus::Online);
        assert_eq!("busy".parse::<PresenceStatus>().unwrap(), PresenceStatus::Busy);
        assert!(matches!(
            "Online".parse::<PresenceStatus>(),
            Err(PresenceError::UnknownStatus(_))
        ));
        assert!(!is_valid("invisible"));
        assert!(is_valid("away"));
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(serde_json::to_string(&PresenceStatus::Away).unwrap(), "\"away\"");
        assert!(serde_json::from_str::<PresenceStatus>("\"sleeping\"").is_err());
    }

    #[test]
    fn test_capabilities_lookup() {
        let info = capabilities("away").unwrap();
        assert_eq!(info.status, PresenceStatus::Away);
        assert!(!info.can_send_messages);
        assert!(info.can_receive_messages);

        assert!(matches!(
            capabilities("gone"),
            Err(PresenceError::UnknownStatus(s)) if s == "gone"
        ));
    }

    #[test]
    fn test_capability_matrix() {
        use Action::*;
        use PresenceStatus::*;

        assert!(can_perform(Online, SendMessages));
        assert!(can_perform(Online, ReceivePopups));
        assert!(!can_perform(Away, SendMessages));
        assert!(!can_perform(Away, JoinRooms));
        assert!(!can_perform(Away, ReceiveNotifications));
        assert!(can_perform(Busy, SendMessages));
        assert!(can_perform(Busy, ReceiveNotifications));
        assert!(!can_perform(Busy, ReceivePopups));

        for status in PresenceStatus::ALL {
            assert!(status.can(ReceiveMessages));
        }
    }

    #[test]
    fn test_named_checks_fail_closed() {
        assert!(can_perform_named("online", "send_messages"));
        assert!(!can_perform_named("online", "send_message"));
        assert!(!can_perform_named("online", ""));
        assert!(!can_perform_named("ghost", "send_messages"));
    }

    #[test]
    fn test_priorities() {
        assert_eq!(PresenceStatus::Online.priority(), 3);
        assert_eq!(PresenceStatus::Busy.priority(), 2);
        assert_eq!(PresenceStatus::Away.priority(), 1);
        assert!(compare(PresenceStatus::Online, PresenceStatus::Away));
        assert!(!compare(PresenceStatus::Away, PresenceStatus::Busy));
    }

    #[test]
    fn test_all_valid_transitions_are_allowed() {
        for from in PresenceStatus::ALL {
            for to in PresenceStatus::ALL {
                let (a, b) = validate_transition(from.as_str(), to.as_str()).unwrap();
                assert_eq!((a, b), (from, to));
            }
        }
    }

    #[test]
    fn test_transition_names_invalid_endpoint() {
        match validate_transition("lost", "online") {
            Err(PresenceError::InvalidStatus { endpoint, value }) => {
                assert_eq!(endpoint, "source");
                assert_eq!(value, "lost");
            }
            other => panic!("Expected InvalidStatus, got {:?}", other),
        }
        assert!(matches!(
            validate_transition("online", "lost"),
            Err(PresenceError::InvalidStatus { endpoint: "target", .. })
        ));
    }

    #[test]
    fn test_auto_transition_fires_only_for_idle_online() {
        let timeout = Duration::from_secs(30 * 60);
        let start = 1_000_000;

        assert_eq!(
            check_auto_transition(start, PresenceStatus::Online, start + 31 * MINUTE_MS, timeout),
            (true, PresenceStatus::Away)
        );
        // Exactly at the timeout is not yet past it.
        assert_eq!(
            check_auto_transition(start, PresenceStatus::Online, start + 30 * MINUTE_MS, timeout),
            (false, PresenceStatus::Online)
        );
        assert_eq!(
            check_auto_transition(start, PresenceStatus::Away, start + 90 * MINUTE_MS, timeout),
            (false, PresenceStatus::Away)
        );
        assert_eq!(
            check_auto_transition(start, PresenceStatus::Busy, start + 90 * MINUTE_MS, timeout),
            (false, PresenceStatus::Busy)
        );
        // Clock skew never underflows.
        assert_eq!(
            check_auto_transition(start, PresenceStatus::Online, start - 1, timeout),
            (false, PresenceStatus::Online)
        );
    }

    #[test]
    fn test_activity_restores_auto_away_only() {
        let timeout = Duration::from_secs(60);
        let mut presence = UserPresence::at("u1", PresenceStatus::Online, 0);

        assert!(presence.apply_auto_away(2 * MINUTE_MS, timeout));
        assert_eq!(presence.status, PresenceStatus::Away);
        assert!(presence.auto_set);

        assert!(presence.record_activity(3 * MINUTE_MS));
        assert_eq!(presence.status, PresenceStatus::Online);
        assert!(!presence.auto_set);
        assert_eq!(presence.last_activity, 3 * MINUTE_MS);

        // A manual Away stays put.
        presence.set_status(PresenceStatus::Away, Some("lunch".into()), 4 * MINUTE_MS);
        assert!(!presence.record_activity(5 * MINUTE_MS));
        assert_eq!(presence.status, PresenceStatus::Away);
        assert_eq!(presence.custom_message.as_deref(), Some("lunch"));
    }

    #[test]
    fn test_action_display_and_parse() {
        assert_eq!(Action::SendMessages.to_string(), "send messages");
        assert_eq!("join_rooms".parse::<Action>().unwrap(), Action::JoinRooms);
        assert!(matches!("fly".parse::<Action>(), Err(PresenceError::UnknownAction(_))));

        let err = PresenceError::ActionNotAllowed {
            status: PresenceStatus::Away,
            action: Action::SendMessages,
        };
        assert_eq!(err.to_string(), "Cannot send messages while away");
    }

    #[test]
    fn test_online_carries_default_timeout() {
        assert_eq!(
            PresenceStatus::Online.info().auto_away_timeout(),
            Some(DEFAULT_AUTO_AWAY_TIMEOUT)
        );
        assert_eq!(PresenceStatus::Busy.info().auto_away_timeout(), None);
    }
}
