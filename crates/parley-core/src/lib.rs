//! # parley-core
//!
//! The presence-aware broadcast hub at the heart of the Parley chat backend.
//!
//! This crate provides:
//!
//! - **Presence** - Status values, the capability table and transition rules
//! - **Delivery** - Per-message routing of recipients by presence
//! - **Session** - Per-connection read/write loops with backpressure and liveness
//! - **Hub** - The serialized registry and room router
//! - **Store** - The persistence collaborator and an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  chat_message  ┌──────────────┐  route  ┌────────────┐
//! │   Session   │───────────────▶│ ChatPipeline │────────▶│  Delivery  │
//! └─────────────┘                └──────────────┘         └────────────┘
//!        ▲ outbound queue               │ broadcast              │
//!        │                              ▼                        ▼
//!        │                       ┌──────────────┐         ┌────────────┐
//!        └───────────────────────│     Hub      │         │  Presence  │
//!                                └──────────────┘         └────────────┘
//! ```

pub mod chat;
pub mod delivery;
pub mod hub;
pub mod message;
pub mod presence;
pub mod queue;
pub mod room;
pub mod session;
pub mod status;
pub mod store;

pub use chat::{ChatOutcome, ChatPipeline};
pub use delivery::{
    delivery_rules_for, route, DeliveryPolicy, DeliveryResult, DeliveryRules, DeliveryStats,
    StatusAwareMessage, StatusLookup,
};
pub use hub::{resolve_room, Hub, HubConfig, HubError, HubHandle, HubStats, MemberInfo};
pub use message::ChatMessage;
pub use presence::{Action, PresenceError, PresenceStatus, StatusInfo, UserId, UserPresence};
pub use room::{RoomId, RoomInfo, FALLBACK_ROOM};
pub use session::{Session, SessionConfig, SessionEnd, SessionId};
pub use status::PresenceService;
pub use store::{MemoryStore, PersistStore, StoreError};
