//! Bounded outbound queue between the hub and a session's write loop.
//!
//! The hub holds the [`OutboundSender`] and never blocks on it: a full queue
//! is reported back so the hub can evict the slow session. Dropping the
//! sender closes the queue, and the write loop stops without draining
//! whatever was still pending.

use bytes::Bytes;
use parley_protocol::codec::encode_batch;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Default number of messages a session may have pending.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Errors returned by [`OutboundSender::try_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("Outbound queue full")]
    Full,
    /// The write loop has stopped.
    #[error("Outbound queue closed")]
    Closed,
}

/// Create a bounded outbound queue.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, closed_rx) = oneshot::channel();

    (
        OutboundSender {
            tx,
            _closed: closed_tx,
        },
        OutboundQueue {
            rx,
            closed: closed_rx,
            is_closed: false,
        },
    )
}

/// Producer side, owned by the hub.
#[derive(Debug)]
pub struct OutboundSender {
    tx: mpsc::Sender<Bytes>,
    // Dropped together with the sender to wake the write loop.
    _closed: oneshot::Sender<()>,
}

impl OutboundSender {
    /// Enqueue a message without waiting.
    pub fn try_send(&self, message: Bytes) -> Result<(), QueueError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Number of messages currently pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Check if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer side, owned by the session's write loop.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
    closed: oneshot::Receiver<()>,
    is_closed: bool,
}

impl OutboundQueue {
    /// Wait for the next message.
    ///
    /// Returns `None` once the sender has been dropped, even if messages
    /// are still pending. Cancel safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.is_closed {
            return None;
        }

        tokio::select! {
            biased;
            _ = &mut self.closed => {
                self.is_closed = true;
                None
            }
            message = self.rx.recv() => message,
        }
    }

    /// Take a message if one is pending.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        if self.is_closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Coalesce `first` and everything currently pending into one frame.
    pub fn next_frame(&mut self, first: Bytes) -> Bytes {
        let mut batch = vec![first];
        while let Some(message) = self.try_recv() {
            batch.push(message);
        }
        encode_batch(&batch)
    }
}
