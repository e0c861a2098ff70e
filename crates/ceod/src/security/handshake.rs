//! Driving a [`SecurityContext`] over a [`MessageTransport`].
//!
//! Handshake tokens always travel as [`MSG_AUTH`] messages. The initiator
//! drives the exchange to completion up front; the acceptor consumes tokens
//! as the connection worker receives them.
//!
//! [`MSG_AUTH`]: crate::protocol::MSG_AUTH

use tracing::debug;

use super::SecurityContext;
use crate::protocol::{Message, MessageTransport, ProtocolError, ProtocolResult};

/// Run the initiator side of the handshake until established.
///
/// # Errors
///
/// Fails on a transport error, a peer close, a non-handshake message while
/// the handshake is in progress, or any security context failure.
pub async fn initiate<T>(transport: &mut T, ctx: &mut SecurityContext) -> ProtocolResult<()>
where
    T: MessageTransport + ?Sized,
{
    let mut token = ctx.step(None)?;
    loop {
        if let Some(out) = token.take() {
            debug!(len = out.len(), "sending handshake token");
            transport.send(Message::auth(out)).await?;
        }
        if ctx.is_established() {
            return Ok(());
        }

        let reply = transport
            .recv()
            .await?
            .ok_or(ProtocolError::ConnectionClosed {
                during: "during handshake",
            })?;
        if !reply.is_auth() {
            return Err(ProtocolError::handshake_violation(format!(
                "expected handshake token, got message type {:#x}",
                reply.msg_type
            )));
        }
        token = ctx.step(Some(&reply.payload))?;
    }
}

/// Feed one received handshake token to the acceptor and send any reply.
///
/// # Errors
///
/// Fails if the context rejects the token (including any token after
/// completion) or the reply cannot be sent.
pub async fn accept_token<T>(
    transport: &mut T,
    ctx: &mut SecurityContext,
    token: &[u8],
) -> ProtocolResult<()>
where
    T: MessageTransport + ?Sized,
{
    debug!(len = token.len(), "received handshake token");
    if let Some(out) = ctx.step(Some(token))? {
        transport.send(Message::auth(out)).await?;
    }
    Ok(())
}
