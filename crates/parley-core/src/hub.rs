//! Connection hub for Parley.
//!
//! The hub owns every registered session and the room index. It runs as a
//! single task that processes one [`HubEvent`] at a time; sessions and
//! request handlers only ever talk to it through a [`HubHandle`]. Because
//! all mutation happens inside that loop, the registry needs no locks and
//! every room sees its messages in one total order.

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use parley_protocol::{encode, WireMessage};

use crate::presence::UserId;
use crate::queue::{OutboundSender, QueueError};
use crate::room::{Room, RoomId};
use crate::session::SessionId;
use crate::store::PersistStore;

/// Hub errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    /// The hub loop is no longer running.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of events that may wait for the hub loop.
    pub intake_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 1024,
        }
    }
}

/// Public description of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    /// Session identifier.
    pub session_id: SessionId,
    /// Display name.
    pub username: String,
    /// Assigned room.
    pub room_id: RoomId,
    /// Authenticated user, if any.
    pub user_id: Option<UserId>,
}

impl MemberInfo {
    /// Describe a session.
    pub fn new(
        session_id: SessionId,
        username: impl Into<String>,
        room_id: impl Into<RoomId>,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            session_id,
            username: username.into(),
            room_id: room_id.into(),
            user_id,
        }
    }
}

/// A session as held by the hub: its description and its outbound queue.
#[derive(Debug)]
pub struct Member {
    info: MemberInfo,
    sender: OutboundSender,
}

impl Member {
    /// Pair a session description with its outbound queue.
    pub fn new(info: MemberInfo, sender: OutboundSender) -> Self {
        Self { info, sender }
    }

    /// Get the session description.
    #[must_use]
    pub fn info(&self) -> &MemberInfo {
        &self.info
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered sessions.
    pub session_count: usize,
    /// Rooms with at least one session.
    pub room_count: usize,
    /// Sessions evicted for falling behind, since start.
    pub evicted_total: u64,
}

/// Events processed by the hub loop.
#[derive(Debug)]
pub enum HubEvent {
    /// Add a session to the registry and its room.
    Register(Member),
    /// Remove a session. Removing an unknown session is a no-op.
    Unregister(SessionId),
    /// Deliver an encoded message to every session in a room.
    Broadcast {
        room_id: RoomId,
        payload: Bytes,
    },
    /// List the sessions in a room.
    RoomMembers {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<MemberInfo>>,
    },
    /// Report statistics.
    Stats { reply: oneshot::Sender<HubStats> },
}

/// The serialized registry and router.
pub struct Hub {
    /// Registered sessions.
    sessions: HashMap<SessionId, Member>,
    /// Non-empty rooms.
    rooms: HashMap<RoomId, Room>,
    /// Event intake.
    receiver: mpsc::Receiver<HubEvent>,
    /// Sessions evicted since start.
    evicted_total: u64,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(config.intake_capacity.max(1));
        let hub = Self {
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            receiver,
            evicted_total: 0,
        };
        (hub, HubHandle { sender })
    }

    /// Create a hub and run it on a new task.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Process events until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }

        info!(sessions = self.sessions.len(), "Hub stopped");
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(member) => self.register(member),
            HubEvent::Unregister(session_id) => self.unregister(&session_id),
            HubEvent::Broadcast { room_id, payload } => self.broadcast(room_id, payload),
            HubEvent::RoomMembers { room_id, reply } => {
                let _ = reply.send(self.room_members(&room_id));
            }
            HubEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register(&mut self, member: Member) {
        let session_id = member.info.session_id.clone();
        if self.sessions.contains_key(&session_id) {
            warn!(session = %session_id, "Session already registered, ignoring");
            return;
        }

        let room_id = member.info.room_id.clone();
        let notice = system_message(WireMessage::user_joined(&room_id, &member.info.username));
        self.sessions.insert(session_id.clone(), member);

        let room = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            debug!(room = %room_id, "Creating room");
            Room::new(room_id.clone())
        });
        room.join(session_id.clone());

        info!(
            session = %session_id,
            room = %room_id,
            members = room.member_count(),
            "Session registered"
        );

        if let Some(notice) = notice {
            self.broadcast(room_id, notice);
        }
    }

    fn unregister(&mut self, session_id: &SessionId) {
        match self.remove(session_id) {
            Some((room_id, Some(notice))) => self.broadcast(room_id, notice),
            Some((_, None)) => {}
            None => trace!(session = %session_id, "Session already removed"),
        }
    }

    /// Remove a session from both indices, closing its queue.
    ///
    /// Returns the session's room and the `user_left` notice for it.
    fn remove(&mut self, session_id: &SessionId) -> Option<(RoomId, Option<Bytes>)> {
        let member = self.sessions.remove(session_id)?;
        let MemberInfo {
            room_id, username, ..
        } = member.info;

        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.leave(session_id);
            if room.is_empty() {
                self.rooms.remove(&room_id);
                debug!(room = %room_id, "Room emptied");
            }
        }

        info!(session = %session_id, room = %room_id, "Session unregistered");
        let notice = system_message(WireMessage::user_left(&room_id, &username));
        Some((room_id, notice))
    }

    fn broadcast(&mut self, room_id: RoomId, payload: Bytes) {
        // Removals emit further notices; process them in order.
        let mut pending = VecDeque::from([(room_id, payload)]);

        while let Some((room_id, payload)) = pending.pop_front() {
            let Some(room) = self.rooms.get(&room_id) else {
                trace!(room = %room_id, "Broadcast to empty room");
                continue;
            };

            let mut delivered = 0usize;
            let mut dropped = Vec::new();
            for session_id in room.members() {
                let Some(member) = self.sessions.get(session_id) else {
                    continue;
                };
                match member.sender.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => dropped.push((session_id.clone(), e)),
                }
            }

            trace!(room = %room_id, delivered, "Broadcast");

            for (session_id, reason) in dropped {
                match reason {
                    QueueError::Full => {
                        warn!(session = %session_id, room = %room_id, "Outbound queue full, evicting session");
                        self.evicted_total += 1;
                    }
                    QueueError::Closed => {
                        debug!(session = %session_id, "Outbound queue closed, removing session");
                    }
                }
                if let Some((room_id, Some(notice))) = self.remove(&session_id) {
                    pending.push_back((room_id, notice));
                }
            }
        }
    }

    fn room_members(&self, room_id: &str) -> Vec<MemberInfo> {
        let mut members: Vec<MemberInfo> = self
            .rooms
            .get(room_id)
            .map(|room| {
                room.members()
                    .filter_map(|id| self.sessions.get(id))
                    .map(|member| member.info.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        members
    }

    fn stats(&self) -> HubStats {
        HubStats {
            session_count: self.sessions.len(),
            room_count: self.rooms.len(),
            evicted_total: self.evicted_total,
        }
    }
}

fn system_message(message: WireMessage) -> Option<Bytes> {
    match encode(&message) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(error = %e, "Failed to encode system message");
            None
        }
    }
}

/// Cloneable handle for submitting events to the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    async fn submit(&self, event: HubEvent) -> Result<(), HubError> {
        self.sender.send(event).await.map_err(|_| HubError::Closed)
    }

    /// Register a session.
    pub async fn register(&self, member: Member) -> Result<(), HubError> {
        self.submit(HubEvent::Register(member)).await
    }

    /// Unregister a session.
    pub async fn unregister(&self, session_id: SessionId) -> Result<(), HubError> {
        self.submit(HubEvent::Unregister(session_id)).await
    }

    /// Broadcast an encoded message to a room.
    pub async fn broadcast(&self, room_id: impl Into<RoomId>, payload: Bytes) -> Result<(), HubError> {
        self.submit(HubEvent::Broadcast {
            room_id: room_id.into(),
            payload,
        })
        .await
    }

    /// List the sessions currently in a room, ordered by session id.
    pub async fn room_members(&self, room_id: impl Into<RoomId>) -> Result<Vec<MemberInfo>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubEvent::RoomMembers {
            room_id: room_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubEvent::Stats { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Check if the hub loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Pick the room for a connecting client.
///
/// An explicit, non-empty request wins. Otherwise the first room listed by
/// the store is used, or `fallback` if the store lists none or fails.
pub async fn resolve_room(requested: Option<&str>, store: &dyn PersistStore, fallback: &str) -> RoomId {
    if let Some(room) = requested.filter(|r| !r.is_empty()) {
        return room.to_string();
    }

    match store.list_rooms().await {
        Ok(rooms) => rooms
            .into_iter()
            .next()
            .map_or_else(|| fallback.to_string(), |room| room.id),
        Err(e) => {
            warn!(error = %e, "Failed to list rooms, using fallback room");
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{outbound_queue, OutboundQueue};
    use crate::store::MemoryStore;
    use parley_protocol::{decode, MessageKind};

    fn member(id: &str, room: &str, capacity: usize) -> (Member, OutboundQueue) {
        let (sender, queue) = outbound_queue(capacity);
        let info = MemberInfo::new(SessionId::from(id), id, room, Some(format!("user-{}", id)));
        (Member::new(info, sender), queue)
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Some(bytes) = queue.try_recv() {
            out.push(decode(&bytes).unwrap());
        }
        out
    }

    fn chat(room: &str, content: &str) -> Bytes {
        encode(&WireMessage::chat(room, "tester", content)).unwrap()
    }

    #[tokio::test]
    async fn test_register_announces_to_room_only() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut qa) = member("a", "general", 16);
        let (b, mut qb) = member("b", "general", 16);
        let (c, mut qc) = member("c", "random", 16);

        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.register(c).await.unwrap();
        hub.stats().await.unwrap();

        let seen_by_a = drain(&mut qa);
        assert_eq!(seen_by_a.len(), 2);
        assert!(seen_by_a.iter().all(|m| m.kind == MessageKind::UserJoined));
        assert_eq!(seen_by_a[1].username.as_deref(), Some("b"));

        assert_eq!(drain(&mut qb).len(), 1);

        let seen_by_c = drain(&mut qc);
        assert_eq!(seen_by_c.len(), 1);
        assert_eq!(seen_by_c[0].room_id.as_deref(), Some("random"));
    }

    #[tokio::test]
    async fn test_broadcast_stays_in_room() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut qa) = member("a", "general", 16);
        let (c, mut qc) = member("c", "random", 16);
        hub.register(a).await.unwrap();
        hub.register(c).await.unwrap();
        hub.stats().await.unwrap();
        drain(&mut qa);
        drain(&mut qc);

        hub.broadcast("general", chat("general", "hello")).await.unwrap();
        hub.broadcast("nowhere", chat("nowhere", "void")).await.unwrap();
        hub.stats().await.unwrap();

        let got = drain(&mut qa);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content.as_deref(), Some("hello"));
        assert!(drain(&mut qc).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_order_is_preserved() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut qa) = member("a", "general", 64);
        hub.register(a).await.unwrap();

        for i in 0..20 {
            hub.broadcast("general", chat("general", &i.to_string()))
                .await
                .unwrap();
        }
        hub.stats().await.unwrap();

        let contents: Vec<String> = drain(&mut qa)
            .into_iter()
            .filter(|m| m.kind == MessageKind::ChatMessage)
            .filter_map(|m| m.content)
            .collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_register_then_unregister_restores_count() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, _qa) = member("a", "general", 16);
        hub.register(a).await.unwrap();
        let before = hub.room_members("general").await.unwrap().len();

        let (b, mut qb) = member("b", "general", 16);
        hub.register(b).await.unwrap();
        hub.unregister(SessionId::from("b")).await.unwrap();
        hub.unregister(SessionId::from("b")).await.unwrap();

        assert_eq!(hub.room_members("general").await.unwrap().len(), before);
        assert_eq!(qb.recv().await, None);
    }

    #[tokio::test]
    async fn test_unregister_announces_departure() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, mut qa) = member("a", "general", 16);
        let (b, _qb) = member("b", "general", 16);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.unregister(SessionId::from("b")).await.unwrap();
        hub.stats().await.unwrap();

        let last = drain(&mut qa).pop().unwrap();
        assert_eq!(last.kind, MessageKind::UserLeft);
        assert_eq!(last.username.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_slow_session_is_evicted() {
        let hub = Hub::spawn(HubConfig::default());
        let (fast, mut q_fast) = member("fast", "general", 64);
        let (slow, mut q_slow) = member("slow", "general", 2);

        hub.register(fast).await.unwrap();
        // slow now holds its own join notice.
        hub.register(slow).await.unwrap();
        hub.broadcast("general", chat("general", "m1")).await.unwrap();
        // slow is full; this one evicts it.
        hub.broadcast("general", chat("general", "m2")).await.unwrap();
        hub.broadcast("general", chat("general", "m3")).await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.evicted_total, 1);
        assert_eq!(stats.session_count, 1);

        let kinds: Vec<MessageKind> = drain(&mut q_fast).into_iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::UserJoined,
                MessageKind::UserJoined,
                MessageKind::ChatMessage,
                MessageKind::ChatMessage,
                MessageKind::UserLeft,
                MessageKind::ChatMessage,
            ]
        );

        assert_eq!(q_slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_queue_is_dropped_without_eviction() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, qa) = member("a", "general", 16);
        hub.register(a).await.unwrap();
        drop(qa);

        hub.broadcast("general", chat("general", "hello")).await.unwrap();
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.room_count, 0);
        assert_eq!(stats.evicted_total, 0);
    }

    #[tokio::test]
    async fn test_room_members() {
        let hub = Hub::spawn(HubConfig::default());
        let (b, _qb) = member("b", "general", 16);
        let (a, _qa) = member("a", "general", 16);
        hub.register(b).await.unwrap();
        hub.register(a).await.unwrap();

        let members = hub.room_members("general").await.unwrap();
        let ids: Vec<&str> = members.iter().map(|m| m.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(members[0].user_id.as_deref(), Some("user-a"));
        assert!(hub.room_members("random").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_ignored() {
        let hub = Hub::spawn(HubConfig::default());
        let (a, _qa) = member("a", "general", 16);
        let (dup, mut q_dup) = member("a", "random", 16);
        hub.register(a).await.unwrap();
        hub.register(dup).await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.session_count, 1);
        assert_eq!(stats.room_count, 1);
        assert_eq!(q_dup.recv().await, None);
    }

    #[tokio::test]
    async fn test_stopped_hub_reports_closed() {
        let (hub, handle) = Hub::new(HubConfig::default());
        drop(hub);
        assert!(handle.is_closed());
        assert_eq!(handle.stats().await, Err(HubError::Closed));
    }

    #[tokio::test]
    async fn test_resolve_room() {
        let seeded = MemoryStore::with_rooms(["lobby", "tech"]);
        let empty = MemoryStore::new();

        assert_eq!(resolve_room(Some("tech"), &seeded, "general").await, "tech");
        assert_eq!(resolve_room(None, &seeded, "general").await, "lobby");
        assert_eq!(resolve_room(Some(""), &seeded, "general").await, "lobby");
        assert_eq!(resolve_room(None, &empty, "general").await, "general");
    }
}
