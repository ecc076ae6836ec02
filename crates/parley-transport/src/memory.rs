//! In-process transport.
//!
//! [`pair`] returns a [`MemoryConnection`] to hand to a session and a
//! [`MemoryPeer`] that plays the remote client. Frames written by the session
//! queue up on a bounded channel, so a peer that stops reading eventually
//! stalls the writer the same way a congested socket would.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{
    Connection, ConnectionId, ConnectionSink, ConnectionStream, Inbound, TransportError,
};

/// Default number of frames buffered towards the peer.
pub const DEFAULT_PEER_CAPACITY: usize = 1024;

/// What the peer observes on its side of the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A data frame.
    Data(Bytes),
    /// A heartbeat ping.
    Ping,
    /// The session closed the connection.
    Close,
}

/// Create a connected pair with the default peer buffer.
#[must_use]
pub fn pair(id: impl Into<ConnectionId>) -> (MemoryConnection, MemoryPeer) {
    pair_with_capacity(id, DEFAULT_PEER_CAPACITY)
}

/// Create a connected pair buffering at most `capacity` frames towards the peer.
#[must_use]
pub fn pair_with_capacity(
    id: impl Into<ConnectionId>,
    capacity: usize,
) -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));

    let connection = MemoryConnection {
        id: id.into(),
        inbound_rx,
        outbound_tx,
    };
    let peer = MemoryPeer {
        inbound_tx: Some(inbound_tx),
        outbound_rx,
    };
    (connection, peer)
}

/// The session side of an in-process pair.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound_tx: mpsc::Sender<PeerEvent>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionSink>, Box<dyn ConnectionStream>) {
        (
            Box::new(MemorySink {
                tx: Some(self.outbound_tx),
            }),
            Box::new(MemoryStream {
                rx: self.inbound_rx,
            }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<PeerEvent>>,
}

impl MemorySink {
    async fn push(&mut self, event: PeerEvent) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl ConnectionSink for MemorySink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.push(PeerEvent::Data(data)).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.push(PeerEvent::Ping).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            // The peer may already be gone.
            let _ = tx.try_send(PeerEvent::Close);
        }
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl ConnectionStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// The remote-client side of an in-process pair.
pub struct MemoryPeer {
    inbound_tx: Option<mpsc::UnboundedSender<Inbound>>,
    outbound_rx: mpsc::Receiver<PeerEvent>,
}

impl MemoryPeer {
    /// Send a data frame to the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has stopped reading or the peer hung up.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.push(Inbound::Data(data.into()))
    }

    /// Send a text frame to the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has stopped reading or the peer hung up.
    pub fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Acknowledge a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has stopped reading or the peer hung up.
    pub fn pong(&self) -> Result<(), TransportError> {
        self.push(Inbound::Heartbeat)
    }

    /// Close the peer's writing side; the session reads end-of-stream.
    pub fn hang_up(&mut self) {
        self.inbound_tx = None;
    }

    /// Wait for the next event from the session.
    ///
    /// Returns `None` once the session has dropped its write half.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.outbound_rx.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.outbound_rx.try_recv().ok()
    }

    /// Wait for the next data frame, skipping pings.
    ///
    /// Returns `None` on close or when the session is gone.
    pub async fn recv_data(&mut self) -> Option<Bytes> {
        loop {
            match self.recv().await? {
                PeerEvent::Data(data) => return Some(data),
                PeerEvent::Ping => continue,
                PeerEvent::Close => return None,
            }
        }
    }

    fn push(&self, item: Inbound) -> Result<(), TransportError> {
        let tx = self
            .inbound_tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(item).map_err(|_| TransportError::ConnectionClosed)
    }
}
