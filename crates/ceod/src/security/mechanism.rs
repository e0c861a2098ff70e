//! Pluggable authentication mechanism interface.

use super::{SecurityFlags, SecurityResult};

/// Result of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Step {
    /// Token to send to the peer, if any.
    pub token: Option<Vec<u8>>,
    /// Whether the mechanism considers the handshake complete.
    pub complete: bool,
}

impl Step {
    /// A step that produced a token and expects more input.
    #[must_use]
    pub const fn continue_with(token: Vec<u8>) -> Self {
        Self {
            token: Some(token),
            complete: false,
        }
    }

    /// A completed step, optionally with a final token for the peer.
    #[must_use]
    pub const fn complete(token: Option<Vec<u8>>) -> Self {
        Self {
            token,
            complete: true,
        }
    }
}

/// A two-party authentication mechanism.
///
/// Mechanisms know nothing about roles beyond their own construction, the
/// required-service policy, or the transport. [`SecurityContext`] drives
/// them and enforces ordering.
///
/// [`SecurityContext`]: super::SecurityContext
pub trait Mechanism: Send {
    /// Consume the peer's token (absent on the initiator's first step) and
    /// produce the next token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed or the peer fails to
    /// authenticate.
    fn step(&mut self, input: Option<&[u8]>) -> SecurityResult<Step>;

    /// Services negotiated so far. Only meaningful after completion.
    fn flags(&self) -> SecurityFlags;

    /// The authenticated peer principal, once complete.
    fn peer_principal(&self) -> Option<&str>;

    /// Protect an outgoing payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism has no session keys yet.
    fn wrap(&mut self, plaintext: &[u8]) -> SecurityResult<Vec<u8>>;

    /// Verify and decrypt an incoming payload.
    ///
    /// # Errors
    ///
    /// Returns an error on tampering, replay or reordering.
    fn unwrap(&mut self, wrapped: &[u8]) -> SecurityResult<Vec<u8>>;
}
