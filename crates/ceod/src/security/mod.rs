//! Mutual-authentication security context.
//!
//! # Architecture
//!
//! ```text
//!   SecurityContext  (state machine, policy, peer identity)
//!         │
//!         ▼
//!   dyn Mechanism    (token production, wrap / unwrap)
//!         │
//!         ▼
//!   PskInitiator / PskAcceptor  (keytab-backed mechanism)
//! ```
//!
//! [`SecurityContext`] owns the handshake lifecycle and enforces the service
//! policy: a completed handshake must provide confidentiality, integrity and
//! mutual authentication, otherwise the connection is aborted before any
//! operation is dispatched. [`handshake`] drives a context over a
//! [`MessageTransport`](crate::protocol::MessageTransport).
//!
//! # Security Considerations
//!
//! - Tokens fed to a context after completion are rejected, never re-stepped
//! - Key material is zeroized on drop
//! - Proofs are compared in constant time

pub mod context;
pub mod handshake;
pub mod keytab;
pub mod mechanism;
pub mod psk;

use std::fmt;

pub use context::{ContextState, SecurityContext};
pub use keytab::{Keytab, KeytabError};
pub use mechanism::{Mechanism, Step};
pub use psk::{PskAcceptor, PskInitiator, WRAP_OVERHEAD};
use thiserror::Error;

use crate::protocol::MAX_MESSAGE_SIZE;

/// Largest plaintext whose wrapped form still fits in one message.
pub const MAX_PLAINTEXT_SIZE: usize = MAX_MESSAGE_SIZE - WRAP_OVERHEAD;

/// Which side of the handshake a context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces the first token (client).
    Initiator,
    /// Consumes the first token (daemon worker).
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Acceptor => write!(f, "acceptor"),
        }
    }
}

/// Negotiated security services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SecurityFlags(u32);

impl SecurityFlags {
    /// No services.
    pub const NONE: Self = Self(0);
    /// Payload confidentiality.
    pub const CONF: Self = Self(1);
    /// Payload integrity.
    pub const INTEG: Self = Self(1 << 1);
    /// Both peers authenticated.
    pub const MUTUAL: Self = Self(1 << 2);
    /// Replayed messages detected.
    pub const REPLAY: Self = Self(1 << 3);
    /// Out-of-sequence messages detected.
    pub const SEQUENCE: Self = Self(1 << 4);

    /// Every service the daemon requires of a completed handshake.
    pub const REQUIRED: Self = Self(Self::CONF.0 | Self::INTEG.0 | Self::MUTUAL.0);

    /// Every service the built-in mechanism can provide.
    pub const ALL: Self = Self(
        Self::CONF.0 | Self::INTEG.0 | Self::MUTUAL.0 | Self::REPLAY.0 | Self::SEQUENCE.0,
    );

    const NAMES: [(Self, &'static str); 5] = [
        (Self::CONF, "conf"),
        (Self::INTEG, "integ"),
        (Self::MUTUAL, "mutual"),
        (Self::REPLAY, "replay"),
        (Self::SEQUENCE, "sequence"),
    ];

    /// Build from raw bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every service in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Services present in both.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Services present in either.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Services present in `self` but not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Check the policy every completed handshake must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::PolicyViolation`] naming each missing
    /// required service.
    pub fn require_services(self) -> SecurityResult<()> {
        let missing = Self::REQUIRED.difference(self);
        if missing == Self::NONE {
            return Ok(());
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| missing.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        Err(SecurityError::PolicyViolation {
            missing: names.join(", "),
        })
    }
}

/// Renders as `+conf +integ +mutual -replay -sequence`.
impl fmt::Display for SecurityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (flag, name)) in Self::NAMES.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let sign = if self.contains(*flag) { '+' } else { '-' };
            write!(f, "{sign}{name}")?;
        }
        Ok(())
    }
}

/// Security context and mechanism errors.
///
/// All variants are fatal to the connection.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// A token arrived after the handshake completed.
    #[error("unexpected {len}-byte token from peer")]
    UnexpectedToken {
        /// Length of the rejected token.
        len: usize,
    },

    /// The initiator produced no token while the handshake is incomplete.
    #[error("handshake incomplete but no token was produced")]
    MissingToken,

    /// The context was stepped in a way its role and state do not allow.
    #[error("invalid handshake step: {reason}")]
    InvalidState {
        /// What was attempted.
        reason: &'static str,
    },

    /// A handshake token could not be decoded.
    #[error("malformed handshake token: {reason}")]
    MalformedToken {
        /// Decoding failure.
        reason: String,
    },

    /// The peer failed to authenticate.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Why authentication failed.
        reason: String,
    },

    /// The handshake completed without a required service.
    #[error("insufficient security services: {missing} required")]
    PolicyViolation {
        /// Comma-separated names of the missing services.
        missing: String,
    },

    /// Wrap or unwrap attempted before the handshake completed.
    #[error("security context not established")]
    NotEstablished,

    /// A wrapped message failed verification or decryption.
    #[error("message protection failure: {reason}")]
    Integrity {
        /// Description of the failure.
        reason: String,
    },

    /// Credential table could not be loaded.
    #[error(transparent)]
    Keytab(#[from] KeytabError),
}

impl SecurityError {
    /// Create a malformed token error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }

    /// Create an authentication failure.
    #[must_use]
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Create a message protection failure.
    #[must_use]
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity {
            reason: reason.into(),
        }
    }
}

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_services_satisfied() {
        assert!(SecurityFlags::REQUIRED.require_services().is_ok());
        assert!(SecurityFlags::ALL.require_services().is_ok());
    }

    #[test]
    fn test_missing_conf_is_policy_violation() {
        let flags = SecurityFlags::INTEG.union(SecurityFlags::MUTUAL);
        let err = flags.require_services().unwrap_err();
        assert!(matches!(
            &err,
            SecurityError::PolicyViolation { missing } if missing == "conf"
        ));
    }

    #[test]
    fn test_every_missing_service_is_named() {
        let err = SecurityFlags::REPLAY.require_services().unwrap_err();
        assert_eq!(
            err.to_string(),
            "insufficient security services: conf, integ, mutual required"
        );
    }

    #[test]
    fn test_flags_display() {
        let flags = SecurityFlags::REQUIRED.union(SecurityFlags::SEQUENCE);
        assert_eq!(flags.to_string(), "+conf +integ +mutual -replay +sequence");
    }

    #[test]
    fn test_from_bits_truncate_drops_unknown() {
        let flags = SecurityFlags::from_bits_truncate(0xFFFF_FFFF);
        assert_eq!(flags, SecurityFlags::ALL);
    }
}
