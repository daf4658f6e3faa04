//! Length-prefixed framing and the message envelope carried inside each frame.
//!
//! After the connect preamble, every message on the wire is one frame:
//!
//! ```text
//! +-------------------+----------+----------+----------------------+
//! | length (4 bytes)  | msg id   | trans id | body                 |
//! | u32 little-endian | u16 LE   | u32 LE   | (length - 6 bytes)   |
//! +-------------------+----------+----------+----------------------+
//! ```
//!
//! The length covers the envelope (msg id, trans id, body) but not the
//! prefix itself. Trans id 0 marks a message that belongs to no pending
//! transaction: keep-alive pings and server-initiated notifications.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Message id reserved for keep-alive pings and ping transactions.
pub const PING_MSG_ID: u16 = 0;

/// Bytes of envelope header in front of the body.
pub const ENVELOPE_HEADER_LEN: usize = 6;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The payload is shorter than an envelope header.
    #[error("payload of {len} bytes is too short for an envelope")]
    Truncated { len: usize },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_id: u16,
    /// Raw transaction id; 0 when the message is not a reply.
    pub trans_id: u32,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(msg_id: u16, trans_id: u32, body: Vec<u8>) -> Self {
        Self {
            msg_id,
            trans_id,
            body,
        }
    }

    /// Keep-alive ping (or its echo) carrying the sender's timestamp.
    pub fn ping(ping_time_ms: u32) -> Self {
        Self::new(PING_MSG_ID, 0, ping_time_ms.to_le_bytes().to_vec())
    }

    /// True for keep-alive traffic that bypasses the transaction registry.
    pub fn is_keepalive(&self) -> bool {
        self.msg_id == PING_MSG_ID && self.trans_id == 0
    }

    /// Serialize into a frame payload (without the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
        buf.extend_from_slice(&self.trans_id.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < ENVELOPE_HEADER_LEN {
            return Err(FrameError::Truncated { len: payload.len() });
        }
        let msg_id = u16::from_le_bytes([payload[0], payload[1]]);
        let trans_id = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        Ok(Self {
            msg_id,
            trans_id,
            body: payload[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }
}

fn closed_or_io(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame and decode its envelope.
///
/// The length prefix is checked against the configured maximum before the
/// body is buffered. A peer that closes mid-frame yields
/// [`FrameError::ConnectionClosed`].
pub async fn read_envelope<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Envelope, FrameError> {
    let len = reader.read_u32_le().await.map_err(closed_or_io)?;
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }
    if (len as usize) < ENVELOPE_HEADER_LEN {
        return Err(FrameError::Truncated { len: len as usize });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    Envelope::decode(&payload)
}

/// Encode an envelope and write it, prefix included, as one buffer.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(ENVELOPE_HEADER_LEN + envelope.body.len()).unwrap_or(u32::MAX);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    let mut frame = Vec::with_capacity(4 + len as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&envelope.encode());
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
