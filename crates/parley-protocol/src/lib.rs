//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat backend.
//!
//! Every frame exchanged with a chat client is a JSON object tagged by its
//! `type` field:
//!
//! ```json
//! {"type": "chat_message", "room_id": "general", "username": "alice", "content": "hello"}
//! ```
//!
//! ## Message Kinds
//!
//! - `chat_message` - A line of chat, the only kind clients send that the hub acts on
//! - `user_joined` / `user_left` - Room membership notices emitted by the hub
//! - `typing` / `status_update` - Reserved for future extension, ignored today
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, WireMessage};
//!
//! let message = WireMessage::chat("general", "alice", "hello");
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE};
pub use message::{MessageKind, WireMessage};
