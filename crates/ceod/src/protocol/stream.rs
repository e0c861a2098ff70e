//! Stream binding: explicit headers over any byte stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

use super::error::ProtocolResult;
use super::framing::MessageCodec;
use super::message::Message;
use super::transport::MessageTransport;

/// [`MessageTransport`] over a byte stream framed with [`MessageCodec`].
///
/// Generic over the stream so the same binding serves TCP sockets in
/// production and in-memory duplex pipes in tests.
#[derive(Debug)]
pub struct StreamTransport<S> {
    framed: Framed<S, MessageCodec>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a transport over a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec::new()),
        }
    }

    /// Get a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        self.framed.get_mut()
    }
}

#[async_trait]
impl<S> MessageTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: Message) -> ProtocolResult<()> {
        self.framed.send(msg).await
    }

    async fn recv(&mut self) -> ProtocolResult<Option<Message>> {
        self.framed.next().await.transpose()
    }

    async fn close(&mut self) -> ProtocolResult<()> {
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, duplex};

    use super::*;
    use crate::protocol::error::{MAX_MESSAGE_SIZE, ProtocolError};

    #[tokio::test]
    async fn test_send_recv_over_duplex() {
        let (a, b) = duplex(1024);
        let mut left = StreamTransport::new(a);
        let mut right = StreamTransport::new(b);

        left.send(Message::new(0x10, &b"0123456789"[..])).await.unwrap();
        let msg = right.recv().await.unwrap().unwrap();
        assert_eq!(msg.msg_type, 0x10);
        assert_eq!(&msg.payload[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_large_message_crosses_small_pipe() {
        let (a, b) = duplex(512);
        let mut left = StreamTransport::new(a);
        let mut right = StreamTransport::new(b);
        let payload = vec![0xA5u8; MAX_MESSAGE_SIZE];

        let sender = tokio::spawn(async move {
            left.send(Message::new(3, payload)).await.unwrap();
            left
        });
        let msg = right.recv().await.unwrap().unwrap();
        assert_eq!(msg.len(), MAX_MESSAGE_SIZE);
        assert!(msg.payload.iter().all(|b| *b == 0xA5));
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_is_seen_as_clean_eof() {
        let (a, b) = duplex(64);
        let mut left = StreamTransport::new(a);
        let mut right = StreamTransport::new(b);

        left.close().await.unwrap();
        assert!(right.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let (a, mut b) = duplex(64);
        let mut left = StreamTransport::new(a);

        let err = left
            .send(Message::new(1, vec![0u8; MAX_MESSAGE_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));

        left.close().await.unwrap();
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
