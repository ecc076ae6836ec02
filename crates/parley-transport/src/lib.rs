//! # parley-transport
//!
//! Connection handle abstraction for the Parley chat backend.
//!
//! A chat session never touches sockets directly. It receives an
//! already-established connection handle that splits into two halves:
//!
//! - a [`ConnectionStream`] the inbound loop reads from
//! - a [`ConnectionSink`] the outbound loop writes to, pings and closes
//!
//! Implementations:
//!
//! - **WebSocket** - axum WebSocket upgrade (feature `websocket`, on by default)
//! - **Memory** - in-process channel pair, useful for tests and benchmarks
//!
//! ```rust,ignore
//! use parley_transport::{Connection, Inbound};
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut sink, mut stream) = conn.split();
//!     while let Ok(Some(Inbound::Data(data))) = stream.recv().await {
//!         let _ = sink.send(data).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, ConnectionSink, ConnectionStream, Inbound, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
