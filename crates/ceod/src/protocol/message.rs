//! The unit exchanged on every transport binding.

use std::fmt;

use bytes::Bytes;

use super::error::MSG_AUTH;

/// An opaque payload tagged with a numeric message type.
///
/// The type is either [`MSG_AUTH`] (a handshake token) or the type tag of a
/// registered operation. Payloads are never interpreted by this layer.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Type tag carried in the header (stream) or PPID (message-oriented).
    pub msg_type: u32,

    /// Payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(msg_type: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Create a handshake-token message.
    #[must_use]
    pub fn auth(token: impl Into<Bytes>) -> Self {
        Self::new(MSG_AUTH, token)
    }

    /// Returns `true` if this message carries a handshake token.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        self.msg_type == MSG_AUTH
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// Payloads may be ciphertext or credentials; only their size is printed.
impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("msg_type", &format_args!("{:#x}", self.msg_type))
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_message() {
        let msg = Message::auth(vec![1, 2, 3]);
        assert!(msg.is_auth());
        assert_eq!(msg.len(), 3);
    }

    #[test]
    fn test_debug_hides_payload() {
        let msg = Message::new(0x42, &b"secret-bytes"[..]);
        let rendered = format!("{msg:?}");
        assert!(rendered.contains("0x42"));
        assert!(rendered.contains("12"));
        assert!(!rendered.contains("secret"));
    }
}
