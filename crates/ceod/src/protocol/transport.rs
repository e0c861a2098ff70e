//! Transport bindings behind one interface.
//!
//! Two bindings carry [`Message`]s:
//!
//! - [`TransportKind::Stream`]: TCP with an explicit 8-byte header per
//!   message ([`StreamTransport`])
//! - [`TransportKind::Message`]: SCTP, where the payload protocol identifier
//!   carries the type and the transport delimits records
//!   ([`SctpTransport`](super::sctp::SctpTransport), Linux only)
//!
//! Application payloads are wrapped by the security context on both
//! bindings. Neither binding relies on the transport for confidentiality.

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProtocolResult;
use super::message::Message;
use super::stream::StreamTransport;

/// A connected, bidirectional message transport.
///
/// Implementations are used by exactly one task; there is no concurrent
/// send and receive on the same transport.
#[async_trait]
pub trait MessageTransport: Send {
    /// Send one message.
    ///
    /// # Errors
    ///
    /// Fails on an empty or oversized payload, or on a transport error.
    async fn send(&mut self, msg: Message) -> ProtocolResult<()>;

    /// Receive one message.
    ///
    /// Returns `Ok(None)` when the peer closed the transport cleanly between
    /// messages.
    ///
    /// # Errors
    ///
    /// Fails on malformed input, a close in the middle of a message, a fatal
    /// transport notification, or a transport error.
    async fn recv(&mut self) -> ProtocolResult<Option<Message>>;

    /// Close the sending direction gracefully.
    ///
    /// # Errors
    ///
    /// Returns the transport's shutdown error.
    async fn close(&mut self) -> ProtocolResult<()>;
}

/// Which binding a daemon and its clients speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TCP with explicit headers.
    #[default]
    Stream,
    /// SCTP with PPID-tagged records.
    Message,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Message => write!(f, "message"),
        }
    }
}

/// Connect to a peer daemon with the given binding.
///
/// # Errors
///
/// Returns the connect error, or `Unsupported` for the message binding on
/// platforms without SCTP.
pub async fn connect(
    kind: TransportKind,
    addr: SocketAddr,
) -> ProtocolResult<Box<dyn MessageTransport>> {
    match kind {
        TransportKind::Stream => {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            Ok(Box::new(StreamTransport::new(stream)))
        },
        TransportKind::Message => connect_message(addr).await,
    }
}

/// Wrap a socket accepted by the master into a transport.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the socket cannot be registered with the reactor.
pub fn from_accepted(kind: TransportKind, fd: OwnedFd) -> ProtocolResult<Box<dyn MessageTransport>> {
    match kind {
        TransportKind::Stream => {
            let std_stream = std::net::TcpStream::from(fd);
            std_stream.set_nonblocking(true)?;
            let stream = tokio::net::TcpStream::from_std(std_stream)?;
            Ok(Box::new(StreamTransport::new(stream)))
        },
        TransportKind::Message => message_from_fd(fd),
    }
}

#[cfg(target_os = "linux")]
async fn connect_message(addr: SocketAddr) -> ProtocolResult<Box<dyn MessageTransport>> {
    let transport = super::sctp::SctpTransport::connect(addr).await?;
    Ok(Box::new(transport))
}

#[cfg(target_os = "linux")]
fn message_from_fd(fd: OwnedFd) -> ProtocolResult<Box<dyn MessageTransport>> {
    Ok(Box::new(super::sctp::SctpTransport::from_fd(fd)?))
}

#[cfg(not(target_os = "linux"))]
async fn connect_message(_addr: SocketAddr) -> ProtocolResult<Box<dyn MessageTransport>> {
    Err(sctp_unsupported())
}

#[cfg(not(target_os = "linux"))]
fn message_from_fd(_fd: OwnedFd) -> ProtocolResult<Box<dyn MessageTransport>> {
    Err(sctp_unsupported())
}

#[cfg(not(target_os = "linux"))]
fn sctp_unsupported() -> super::error::ProtocolError {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "message-oriented transport requires SCTP (Linux only)",
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            transport: TransportKind,
        }

        let w: Wrapper = toml::from_str("transport = \"message\"").unwrap();
        assert_eq!(w.transport, TransportKind::Message);
        let w: Wrapper = toml::from_str("transport = \"stream\"").unwrap();
        assert_eq!(w.transport, TransportKind::Stream);
        assert!(toml::from_str::<Wrapper>("transport = \"udp\"").is_err());
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Stream.to_string(), "stream");
        assert_eq!(TransportKind::Message.to_string(), "message");
        assert_eq!(TransportKind::default(), TransportKind::Stream);
    }
}
