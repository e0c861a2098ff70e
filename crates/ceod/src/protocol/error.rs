//! Protocol error types for the ceod wire layer.
//!
//! This module provides structured error types for protocol-level failures,
//! enabling callers to distinguish between different failure modes.
//!
//! # Error Hierarchy
//!
//! - [`ProtocolError`]: Top-level error for framing, transport and handshake
//!   ordering failures
//! - Security, registry and dispatch failures convert into it so a worker can
//!   report every fatal condition through one type
//!
//! Every variant is fatal to the connection it occurred on. There are no
//! retries at this layer.

use std::io;

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::security::SecurityError;

/// Maximum payload size in bytes (64 KiB).
///
/// Bounds the memory a single message can pin. A declared length above this
/// is rejected before any payload allocation.
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Size of the stream binding header: `[length: u32 BE][type: u32 BE]`.
pub const HEADER_LEN: usize = 8;

/// Increment by which receive buffers grow while a payload arrives.
pub const BUFFER_INCREMENT: usize = 4096;

/// Message type reserved for handshake tokens.
///
/// Never dispatched as an operation.
pub const MSG_AUTH: u32 = 0x800_0000;

/// Reserved message type. Never registrable as an operation.
pub const MSG_EXPLODE: u32 = 0x800_0001;

/// Returns `true` if `msg_type` is reserved by the protocol.
#[must_use]
pub const fn is_reserved_type(msg_type: u32) -> bool {
    msg_type == MSG_AUTH || msg_type == MSG_EXPLODE
}

/// Protocol errors for the ceod wire layer.
///
/// # Error Classification
///
/// - **Framing errors**: malformed headers, zero or oversized lengths, short
///   reads
/// - **Ordering errors**: handshake tokens out of sequence, response type
///   mismatch
/// - **Transport errors**: I/O failures and transport notifications
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds [`MAX_MESSAGE_SIZE`].
    ///
    /// Detected from the header BEFORE allocation on receive, and before any
    /// bytes are written on send.
    #[error("message too large: {size} bytes exceeds maximum {max} bytes")]
    MessageTooLarge {
        /// Declared or actual payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    /// Header declared a zero-length payload.
    #[error("length is zero in message header")]
    EmptyMessage,

    /// The peer closed the transport in the middle of a message.
    #[error("short {what} received: got {got} of {expected} bytes")]
    ShortRead {
        /// Which part of the message was truncated.
        what: &'static str,
        /// Bytes received before end-of-stream.
        got: usize,
        /// Bytes required.
        expected: usize,
    },

    /// The peer violated the handshake sequence.
    #[error("handshake violation: {reason}")]
    HandshakeViolation {
        /// Description of the violation.
        reason: String,
    },

    /// A response arrived tagged with a different type than the request.
    #[error("wrong message type from server: expected {expected:#x} got {got:#x}")]
    TypeMismatch {
        /// Type of the request.
        expected: u32,
        /// Type of the response.
        got: u32,
    },

    /// Connection was closed before an expected message arrived.
    #[error("connection closed {during}")]
    ConnectionClosed {
        /// Phase in which the close happened.
        during: &'static str,
    },

    /// The message-oriented transport reported association loss or shutdown.
    #[error("transport association terminated: {event}")]
    AssociationTerminated {
        /// Decoded notification.
        event: String,
    },

    /// Security context failure (mechanism error or policy violation).
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Operation dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create a message too large error.
    #[must_use]
    pub const fn message_too_large(size: usize) -> Self {
        Self::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a handshake violation error.
    #[must_use]
    pub fn handshake_violation(reason: impl Into<String>) -> Self {
        Self::HandshakeViolation {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates a protocol violation by the
    /// peer, as opposed to a local or transport failure.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::MessageTooLarge { .. }
                | Self::EmptyMessage
                | Self::ShortRead { .. }
                | Self::HandshakeViolation { .. }
                | Self::TypeMismatch { .. }
                | Self::Dispatch(DispatchError::UnknownOperation { .. })
                | Self::Security(
                    SecurityError::UnexpectedToken { .. }
                        | SecurityError::MissingToken
                        | SecurityError::InvalidState { .. }
                        | SecurityError::MalformedToken { .. }
                )
        )
    }

    /// Returns `true` if this error is a security policy violation.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(self, Self::Security(SecurityError::PolicyViolation { .. }))
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_too_large_error() {
        let err = ProtocolError::message_too_large(70_000);
        assert!(err.is_protocol_violation());

        let msg = err.to_string();
        assert!(msg.contains("70000"));
        assert!(msg.contains(&MAX_MESSAGE_SIZE.to_string()));
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = ProtocolError::TypeMismatch {
            expected: 0x10,
            got: 0x11,
        };
        assert!(err.is_protocol_violation());
        assert_eq!(
            err.to_string(),
            "wrong message type from server: expected 0x10 got 0x11"
        );
    }

    #[test]
    fn test_io_error_is_not_violation() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = ProtocolError::from(io_err);
        assert!(!err.is_protocol_violation());
        assert!(!err.is_security_violation());
    }

    #[test]
    fn test_reserved_types() {
        assert!(is_reserved_type(MSG_AUTH));
        assert!(is_reserved_type(MSG_EXPLODE));
        assert!(!is_reserved_type(0x1));
    }

    #[test]
    fn test_constants() {
        assert_eq!(MAX_MESSAGE_SIZE, 65536);
        assert_eq!(HEADER_LEN, 8);
        assert_eq!(MSG_AUTH, 0x0800_0000);
    }
}
