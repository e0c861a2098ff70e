//! Wire protocol: messages, framing and transport bindings.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Operation payloads (opaque)       │
//! ├─────────────────────────────────────────┤
//! │     Security context (wrap / unwrap)     │  crate::security
//! ├─────────────────────────────────────────┤
//! │        Message { type, payload }         │
//! ├────────────────────┬────────────────────┤
//! │   Stream binding   │  Message binding   │
//! │  8-byte header     │  PPID + EOR        │
//! │  TCP               │  SCTP              │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: [`ProtocolError`], wire constants, reserved types
//! - [`message`]: [`Message`]
//! - [`framing`]: stream binding codec ([`MessageCodec`])
//! - [`transport`]: [`MessageTransport`] and binding selection
//! - [`stream`]: [`StreamTransport`]
//! - `sctp`: `SctpTransport` (Linux only)
//!
//! # Wire Format (stream binding)
//!
//! ```text
//! +----------------------+----------------------+-------------------+
//! | Length (4 bytes, BE) | Type (4 bytes, BE)   | Payload           |
//! +----------------------+----------------------+-------------------+
//! ```
//!
//! - Maximum payload: 64 KiB
//! - Type `0x8000000` carries handshake tokens

pub mod error;
pub mod framing;
pub mod message;
#[cfg(target_os = "linux")]
pub mod sctp;
pub mod stream;
pub mod transport;

pub use error::{
    BUFFER_INCREMENT, HEADER_LEN, MAX_MESSAGE_SIZE, MSG_AUTH, MSG_EXPLODE, ProtocolError,
    ProtocolResult, is_reserved_type,
};
pub use framing::MessageCodec;
pub use message::Message;
#[cfg(target_os = "linux")]
pub use sctp::SctpTransport;
pub use stream::StreamTransport;
pub use transport::{MessageTransport, TransportKind, connect, from_accepted};
