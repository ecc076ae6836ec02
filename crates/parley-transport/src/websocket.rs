//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`Connection`] traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{
    Connection, ConnectionId, ConnectionSink, ConnectionStream, Inbound, TransportError,
};

/// A WebSocket connection produced by an HTTP upgrade.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionSink>, Box<dyn ConnectionStream>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSink {
                id: self.id.clone(),
                sink,
            }),
            Box::new(WebSocketStream { id: self.id, stream }),
        )
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ConnectionSink for WebSocketSink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        // Chat frames are JSON; anything else goes out as binary.
        let message = match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!(connection = %self.id, "Closing WebSocket");
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

/// Read half of a [`WebSocketConnection`].
pub struct WebSocketStream {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl ConnectionStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Inbound::Data(Bytes::from(text)))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Inbound::Data(Bytes::from(data)))),
            // axum answers pings itself; either direction proves liveness.
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => Ok(Some(Inbound::Heartbeat)),
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %self.id, "Received close frame");
                Ok(None)
            }
            Some(Err(e)) if is_capacity_error(&e) => {
                warn!(connection = %self.id, error = %e, "WebSocket message over size limit");
                Err(TransportError::MessageTooLarge(e.to_string()))
            }
            Some(Err(e)) => {
                warn!(connection = %self.id, error = %e, "WebSocket error");
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => {
                debug!(connection = %self.id, "WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

/// Whether a receive error is the upgrade's message or frame size limit.
///
/// axum boxes the underlying tungstenite error, whose crate version is not
/// ours to name, so the capacity error is recognised by its message.
fn is_capacity_error(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = source {
        if is_capacity_message(&e.to_string()) {
            return true;
        }
        source = e.source();
    }
    false
}

fn is_capacity_message(message: &str) -> bool {
    message.contains("Space limit exceeded")
}
