//! Codec for encoding and decoding Parley messages.
//!
//! Messages travel as compact JSON. Several encoded messages can be coalesced
//! into one outbound frame by joining them with a newline; JSON escapes
//! newlines inside strings, so the separator never appears within a message.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::WireMessage;

/// Default maximum size of a single inbound message (512 bytes).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Separator between messages coalesced into one frame.
pub const BATCH_SEPARATOR: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds the configured maximum size.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &WireMessage) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    Ok(Bytes::from(payload))
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the data is not a valid message.
pub fn decode(data: &[u8]) -> Result<WireMessage, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Decode a message, rejecting anything larger than `max_size` bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid message.
pub fn decode_bounded(data: &[u8], max_size: usize) -> Result<WireMessage, ProtocolError> {
    check_size(data.len(), max_size)?;
    decode(data)
}

/// Check a message length against a limit.
///
/// # Errors
///
/// Returns [`ProtocolError::MessageTooLarge`] if `size` exceeds `max_size`.
pub fn check_size(size: usize, max_size: usize) -> Result<(), ProtocolError> {
    if size > max_size {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: max_size,
        });
    }
    Ok(())
}

/// Coalesce already-encoded messages into a single frame.
#[must_use]
pub fn encode_batch(messages: &[Bytes]) -> Bytes {
    match messages {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let total = messages.iter().map(Bytes::len).sum::<usize>() + messages.len() - 1;
            let mut buf = BytesMut::with_capacity(total);
            for (i, message) in messages.iter().enumerate() {
                if i > 0 {
                    buf.put_u8(BATCH_SEPARATOR);
                }
                buf.extend_from_slice(message);
            }
            buf.freeze()
        }
    }
}

/// Split a received frame back into its individual messages.
pub fn split_batch(frame: &[u8]) -> impl Iterator<Item = &[u8]> {
    frame
        .split(|b| *b == BATCH_SEPARATOR)
        .filter(|part| !part.is_empty())
}
