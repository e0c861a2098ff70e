//! Handshake lifecycle and policy enforcement.

use std::cell::OnceCell;
use std::fmt;

use tracing::{debug, info};

use super::mechanism::Mechanism;
use super::{Role, SecurityError, SecurityFlags, SecurityResult};

/// Lifecycle of a [`SecurityContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextState {
    /// No token has been produced or consumed.
    #[default]
    Uninitialized,
    /// Tokens are being exchanged.
    TokenExchange,
    /// Handshake complete; required services verified.
    Established,
}

/// One side of a mutual-authentication handshake.
///
/// ```text
/// Uninitialized ──step──▶ TokenExchange ──step…──▶ Established
///       │                                              ▲
///       └──────────── step (single round) ─────────────┘
/// ```
///
/// Exclusively owned by one connection. Not `Sync`.
pub struct SecurityContext {
    role: Role,
    state: ContextState,
    mechanism: Box<dyn Mechanism>,
    peer: Option<String>,
    username: OnceCell<String>,
}

impl SecurityContext {
    /// Create a context in the [`ContextState::Uninitialized`] state.
    #[must_use]
    pub fn new(role: Role, mechanism: Box<dyn Mechanism>) -> Self {
        Self {
            role,
            state: ContextState::Uninitialized,
            mechanism,
            peer: None,
            username: OnceCell::new(),
        }
    }

    /// The role this context plays.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContextState {
        self.state
    }

    /// Returns `true` once the handshake completed and passed policy.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == ContextState::Established
    }

    /// Negotiated services, empty until established.
    #[must_use]
    pub fn flags(&self) -> SecurityFlags {
        if self.is_established() {
            self.mechanism.flags()
        } else {
            SecurityFlags::NONE
        }
    }

    /// Authenticated peer principal, available once established.
    #[must_use]
    pub fn peer_principal(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Peer principal with any `@REALM` suffix removed.
    ///
    /// Computed on first use and cached.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        let principal = self.peer.as_deref()?;
        Some(
            self.username
                .get_or_init(|| short_name(principal).to_string())
                .as_str(),
        )
    }

    /// Advance the handshake by one step.
    ///
    /// The initiator's first call takes no input; every other call takes the
    /// peer's token. Returns the token to send, if any.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::UnexpectedToken`] if already established
    /// - [`SecurityError::MissingToken`] if an incomplete initiator step
    ///   produced nothing to send
    /// - [`SecurityError::PolicyViolation`] if the handshake completed
    ///   without a required service
    /// - any mechanism failure
    pub fn step(&mut self, input: Option<&[u8]>) -> SecurityResult<Option<Vec<u8>>> {
        if self.state == ContextState::Established {
            return Err(SecurityError::UnexpectedToken {
                len: input.map_or(0, <[u8]>::len),
            });
        }
        match (self.role, self.state, input.is_some()) {
            (Role::Initiator, ContextState::Uninitialized, true) => {
                return Err(SecurityError::InvalidState {
                    reason: "initiator received a token before producing one",
                });
            },
            (Role::Initiator, ContextState::TokenExchange, false)
            | (Role::Acceptor, _, false) => {
                return Err(SecurityError::InvalidState {
                    reason: "handshake step requires a peer token",
                });
            },
            _ => {},
        }

        let step = self.mechanism.step(input)?;

        if step.complete {
            let flags = self.mechanism.flags();
            debug!(role = %self.role, services = %flags, "security services negotiated");
            flags.require_services()?;

            let peer = self
                .mechanism
                .peer_principal()
                .ok_or_else(|| SecurityError::authentication("mechanism reported no peer"))?
                .to_string();
            match self.role {
                Role::Acceptor => info!(principal = %peer, "client authenticated as {peer}"),
                Role::Initiator => info!(principal = %peer, "server authenticated as {peer}"),
            }
            self.peer = Some(peer);
            self.state = ContextState::Established;
        } else {
            if self.role == Role::Initiator && step.token.is_none() {
                return Err(SecurityError::MissingToken);
            }
            self.state = ContextState::TokenExchange;
        }

        Ok(step.token)
    }

    /// Protect an application payload for sending.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotEstablished`] before completion, or the
    /// mechanism's failure.
    pub fn wrap(&mut self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        if !self.is_established() {
            return Err(SecurityError::NotEstablished);
        }
        self.mechanism.wrap(plaintext)
    }

    /// Recover an application payload from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotEstablished`] before completion, or the
    /// mechanism's failure on tampering, replay or reordering.
    pub fn unwrap(&mut self, wrapped: &[u8]) -> SecurityResult<Vec<u8>> {
        if !self.is_established() {
            return Err(SecurityError::NotEstablished);
        }
        self.mechanism.unwrap(wrapped)
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn short_name(principal: &str) -> &str {
    principal
        .split_once('@')
        .map_or(principal, |(name, _realm)| name)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::security::mechanism::Step;

    /// Replays a fixed sequence of steps and echoes payloads on wrap.
    struct Scripted {
        steps: VecDeque<Step>,
        flags: SecurityFlags,
        peer: Option<String>,
    }

    impl Scripted {
        fn boxed(steps: Vec<Step>, flags: SecurityFlags, peer: Option<&str>) -> Box<Self> {
            Box::new(Self {
                steps: steps.into(),
                flags,
                peer: peer.map(str::to_string),
            })
        }
    }

    impl Mechanism for Scripted {
        fn step(&mut self, _input: Option<&[u8]>) -> SecurityResult<Step> {
            self.steps
                .pop_front()
                .ok_or_else(|| SecurityError::malformed("script exhausted"))
        }

        fn flags(&self) -> SecurityFlags {
            self.flags
        }

        fn peer_principal(&self) -> Option<&str> {
            self.peer.as_deref()
        }

        fn wrap(&mut self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
            Ok(plaintext.to_vec())
        }

        fn unwrap(&mut self, wrapped: &[u8]) -> SecurityResult<Vec<u8>> {
            Ok(wrapped.to_vec())
        }
    }

    fn acceptor(flags: SecurityFlags) -> SecurityContext {
        SecurityContext::new(
            Role::Acceptor,
            Scripted::boxed(
                vec![Step::continue_with(vec![2]), Step::complete(None)],
                flags,
                Some("alice@CSCLUB.UWATERLOO.CA"),
            ),
        )
    }

    #[test]
    fn test_acceptor_establishes() {
        let mut ctx = acceptor(SecurityFlags::ALL);
        assert_eq!(ctx.state(), ContextState::Uninitialized);

        assert_eq!(ctx.step(Some(&[1])).unwrap(), Some(vec![2]));
        assert_eq!(ctx.state(), ContextState::TokenExchange);
        assert!(ctx.peer_principal().is_none());
        assert!(ctx.wrap(b"x").is_err());

        assert_eq!(ctx.step(Some(&[3])).unwrap(), None);
        assert!(ctx.is_established());
        assert_eq!(ctx.peer_principal(), Some("alice@CSCLUB.UWATERLOO.CA"));
        assert_eq!(ctx.username(), Some("alice"));
        assert_eq!(ctx.flags(), SecurityFlags::ALL);
    }

    #[test]
    fn test_step_after_established_is_rejected() {
        let mut ctx = acceptor(SecurityFlags::ALL);
        ctx.step(Some(&[1])).unwrap();
        ctx.step(Some(&[3])).unwrap();

        let err = ctx.step(Some(&[9, 9, 9])).unwrap_err();
        assert!(matches!(err, SecurityError::UnexpectedToken { len: 3 }));
    }

    #[test]
    fn test_missing_confidentiality_is_fatal() {
        let mut ctx = acceptor(SecurityFlags::INTEG.union(SecurityFlags::MUTUAL));
        ctx.step(Some(&[1])).unwrap();

        let err = ctx.step(Some(&[3])).unwrap_err();
        assert!(matches!(err, SecurityError::PolicyViolation { .. }));
        assert!(!ctx.is_established());
        assert!(ctx.peer_principal().is_none());
    }

    #[test]
    fn test_missing_mutual_is_fatal() {
        let mut ctx = acceptor(SecurityFlags::CONF.union(SecurityFlags::INTEG));
        ctx.step(Some(&[1])).unwrap();
        assert!(matches!(
            ctx.step(Some(&[3])),
            Err(SecurityError::PolicyViolation { missing }) if missing == "mutual"
        ));
    }

    #[test]
    fn test_initiator_without_token_is_violation() {
        let mut ctx = SecurityContext::new(
            Role::Initiator,
            Scripted::boxed(
                vec![Step {
                    token: None,
                    complete: false,
                }],
                SecurityFlags::ALL,
                None,
            ),
        );
        assert!(matches!(ctx.step(None), Err(SecurityError::MissingToken)));
    }

    #[test]
    fn test_initiator_first_step_takes_no_input() {
        let mut ctx = SecurityContext::new(
            Role::Initiator,
            Scripted::boxed(vec![], SecurityFlags::ALL, None),
        );
        assert!(matches!(
            ctx.step(Some(&[1])),
            Err(SecurityError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_acceptor_requires_input() {
        let mut ctx = acceptor(SecurityFlags::ALL);
        assert!(matches!(
            ctx.step(None),
            Err(SecurityError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_username_without_realm() {
        assert_eq!(short_name("bob"), "bob");
        assert_eq!(short_name("bob@REALM"), "bob");
        assert_eq!(short_name("ceod/host@REALM"), "ceod/host");
    }
}
