//! Stream binding codec.
//!
//! # Wire Format
//!
//! ```text
//! +----------------------+----------------------+-------------------+
//! | Length (4 bytes, BE) | Type (4 bytes, BE)   | Payload           |
//! +----------------------+----------------------+-------------------+
//! ```
//!
//! - Length counts payload bytes only and must be in `1..=MAX_MESSAGE_SIZE`
//! - A clean end-of-stream before any header byte means "no message"
//! - End-of-stream anywhere inside a message is fatal
//!
//! # Security Considerations
//!
//! The declared length is validated BEFORE the receive buffer grows, and the
//! buffer then grows by at most [`BUFFER_INCREMENT`] per read, so a peer that
//! announces a large payload and stalls cannot make the worker allocate
//! memory it never sends.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{
    BUFFER_INCREMENT, HEADER_LEN, MAX_MESSAGE_SIZE, ProtocolError, ProtocolResult,
};
use super::message::Message;

/// Codec for `[length][type][payload]` framed messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec {
    /// Header of the message currently being received, once parsed.
    pending: Option<(usize, u32)>,
}

impl MessageCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }
}

/// Validate a declared or actual payload length.
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyMessage`] for zero and
/// [`ProtocolError::MessageTooLarge`] above [`MAX_MESSAGE_SIZE`].
pub fn check_length(len: usize) -> ProtocolResult<()> {
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::message_too_large(len));
    }
    Ok(())
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        let (len, msg_type) = if let Some(header) = self.pending {
            header
        } else {
            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }
            let len = src.get_u32() as usize;
            let msg_type = src.get_u32();
            check_length(len)?;
            self.pending = Some((len, msg_type));
            (len, msg_type)
        };

        if src.len() < len {
            let missing = len - src.len();
            src.reserve(missing.min(BUFFER_INCREMENT));
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len).freeze();
        Ok(Some(Message { msg_type, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        match self.pending {
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::ShortRead {
                what: "header",
                got: src.len(),
                expected: HEADER_LEN,
            }),
            Some((len, _)) => Err(ProtocolError::ShortRead {
                what: "message",
                got: src.len(),
                expected: len,
            }),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        check_length(msg.payload.len())?;

        dst.reserve(HEADER_LEN + msg.payload.len());
        // Bounded by MAX_MESSAGE_SIZE above.
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(msg.payload.len() as u32);
        dst.put_u32(msg.msg_type);
        dst.extend_from_slice(&msg.payload);
        Ok(())
    }
}
