//! Connection worker.
//!
//! Each accepted connection is served by exactly one forked worker process.
//! The worker owns the connection end to end:
//!
//! ```text
//! recv ──▶ MSG_AUTH? ──yes──▶ accept_token ──▶ (reply token)
//!   │          │
//!   │          no ──▶ established? ──no──▶ fatal
//!   │                      │
//!   │                     yes ──▶ resolve type ──▶ unwrap ──▶ run op
//!   │                                                         │
//!   └────────────────────── send wrap(response) ◀──────────────┘
//! ```
//!
//! A clean close by the peer ends the loop successfully. Every error is
//! fatal to the connection; the worker logs it and exits non-zero.

use std::os::fd::OwnedFd;

use tracing::{debug, error, info};

use super::{ServerContext, signals};
use crate::dispatch::Dispatcher;
use crate::protocol::{self, Message, MessageTransport, ProtocolError, ProtocolResult};
use crate::security::SecurityContext;
use crate::security::handshake::accept_token;

/// Serve one connection until the peer closes it.
///
/// `security` must be a fresh acceptor context. Nothing is dispatched until
/// it is established, and a non-handshake message before that point is a
/// protocol violation.
///
/// # Errors
///
/// Returns the first fatal condition: a transport or framing error, a
/// handshake or policy failure, an unknown operation type, or an operation
/// failure.
pub async fn serve_connection<T>(
    dispatcher: &Dispatcher<'_>,
    transport: &mut T,
    security: &mut SecurityContext,
    peer: &str,
) -> ProtocolResult<()>
where
    T: MessageTransport + ?Sized,
{
    loop {
        let Some(msg) = transport.recv().await? else {
            info!(peer = %peer, "connection closed by peer {peer}");
            return Ok(());
        };

        if msg.is_auth() {
            accept_token(transport, security, &msg.payload).await?;
            continue;
        }
        if !security.is_established() {
            return Err(ProtocolError::handshake_violation(format!(
                "message type {:#x} before authentication",
                msg.msg_type
            )));
        }

        let op = dispatcher.resolve(msg.msg_type)?;
        let user = security
            .username()
            .ok_or_else(|| ProtocolError::handshake_violation("no authenticated user"))?
            .to_owned();
        let request = security.unwrap(&msg.payload)?;
        debug!(op = %op.name, len = request.len(), "request decrypted");

        let response = dispatcher.run(op, &user, &request).await?;
        let wrapped = security.wrap(&response)?;
        transport.send(Message::new(msg.msg_type, wrapped)).await?;
    }
}

/// Entry point of a freshly forked worker. Returns the exit code.
///
/// Must be called in the child right after `fork`, before any other thread
/// or runtime exists in it.
pub fn run_child(ctx: &ServerContext, fd: OwnedFd, peer: &str) -> i32 {
    info!(peer = %peer, "accepted connection from {peer}");

    if let Err(e) = signals::install_worker() {
        error!(error = %e, "cannot install worker signal handlers");
        return 1;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start worker runtime");
            return 1;
        },
    };

    let result: ProtocolResult<()> = runtime.block_on(async move {
        let mut transport = protocol::from_accepted(ctx.transport(), fd)?;
        let mut security = ctx.new_acceptor();
        let dispatcher = ctx.dispatcher();
        serve_connection(&dispatcher, transport.as_mut(), &mut security, peer).await
    });

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(
                peer = %peer,
                protocol_violation = e.is_protocol_violation(),
                security_violation = e.is_security_violation(),
                "fatal: {e}"
            );
            1
        },
    }
}
