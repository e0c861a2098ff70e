//! Pre-shared-key authentication mechanism.
//!
//! # Handshake
//!
//! ```text
//! Initiator                                        Acceptor
//!   │ INIT   [v][1][flags][nonce_c][client][target]    │
//!   │ ───────────────────────────────────────────────▶ │ look up client key,
//!   │                                                  │ check target
//!   │ REPLY  [v][2][granted][nonce_s][proof_a]         │
//!   │ ◀─────────────────────────────────────────────── │
//!   │ verify proof_a                                   │
//!   │ PROOF  [v][3][proof_i]                           │
//!   │ ───────────────────────────────────────────────▶ │ verify proof_i
//!   ▼ established                           established ▼
//! ```
//!
//! Both proofs and both per-direction session keys are HMAC-SHA256 over the
//! INIT token and the unauthenticated part of the REPLY token, under the
//! shared key and a distinct label. Strings are length-prefixed (u16 BE).
//!
//! # Message Protection
//!
//! `wrap` produces `[seq: u64 BE][AES-256-GCM ciphertext || tag]` with the
//! nonce `[0; 4] || seq`. Each direction has its own key and counter, and a
//! receiver accepts only the next expected sequence number, so replayed,
//! dropped or reordered messages fail to unwrap.
//!
//! # Security Considerations
//!
//! - Proofs are compared with [`subtle::ConstantTimeEq`]
//! - Shared and derived keys live in [`Zeroizing`] buffers
//! - Services are granted only when requested and actually provided;
//!   `MUTUAL` only once the peer's proof has verified. The context, not the
//!   mechanism, enforces which services are required

use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Nonce};
use bytes::{Buf, BufMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::keytab::{KEY_LEN, Key, Keytab};
use super::mechanism::{Mechanism, Step};
use super::{SecurityError, SecurityFlags, SecurityResult};

type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 1;
const KIND_INIT: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_PROOF: u8 = 3;

const NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;
const SEQ_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// Bytes `wrap` adds to a plaintext: the sequence number and the GCM tag.
pub const WRAP_OVERHEAD: usize = SEQ_LEN + TAG_LEN;

/// Services the message layer provides once any session exists. Mutual
/// authentication is added only after both proofs have verified.
const SESSION_SERVICES: SecurityFlags = SecurityFlags::CONF
    .union(SecurityFlags::INTEG)
    .union(SecurityFlags::REPLAY)
    .union(SecurityFlags::SEQUENCE);

const LABEL_ACCEPTOR_PROOF: &[u8] = b"ceod-psk acceptor proof";
const LABEL_INITIATOR_PROOF: &[u8] = b"ceod-psk initiator proof";
const LABEL_INITIATOR_TO_ACCEPTOR: &[u8] = b"ceod-psk initiator to acceptor";
const LABEL_ACCEPTOR_TO_INITIATOR: &[u8] = b"ceod-psk acceptor to initiator";

/// Service principal for `service` on `host`, e.g. `ceod@host.example`.
#[must_use]
pub fn service_principal(service: &str, host: &str) -> String {
    format!("{service}@{host}")
}

struct InitToken {
    flags: SecurityFlags,
    nonce: [u8; NONCE_LEN],
    principal: String,
    target: String,
}

impl InitToken {
    fn encode(&self) -> SecurityResult<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + 4 + NONCE_LEN + 4 + self.principal.len() + self.target.len());
        out.put_u8(VERSION);
        out.put_u8(KIND_INIT);
        out.put_u32(self.flags.bits());
        out.put_slice(&self.nonce);
        put_str(&mut out, &self.principal)?;
        put_str(&mut out, &self.target)?;
        Ok(out)
    }

    fn decode(mut buf: &[u8]) -> SecurityResult<Self> {
        expect_header(&mut buf, KIND_INIT)?;
        let flags = SecurityFlags::from_bits_truncate(take_u32(&mut buf)?);
        let nonce = take_array::<NONCE_LEN>(&mut buf)?;
        let principal = take_str(&mut buf)?;
        let target = take_str(&mut buf)?;
        expect_end(buf)?;
        Ok(Self {
            flags,
            nonce,
            principal,
            target,
        })
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> SecurityResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| SecurityError::malformed("name too long"))?;
    out.put_u16(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn expect_header(buf: &mut &[u8], kind: u8) -> SecurityResult<()> {
    let [version, got] = take_array::<2>(buf)?;
    if version != VERSION {
        return Err(SecurityError::malformed(format!(
            "unsupported version {version}"
        )));
    }
    if got != kind {
        return Err(SecurityError::malformed(format!(
            "expected token kind {kind}, got {got}"
        )));
    }
    Ok(())
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> SecurityResult<[u8; N]> {
    if buf.remaining() < N {
        return Err(SecurityError::malformed("token truncated"));
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_u32(buf: &mut &[u8]) -> SecurityResult<u32> {
    take_array::<4>(buf).map(u32::from_be_bytes)
}

fn take_str(buf: &mut &[u8]) -> SecurityResult<String> {
    let len = usize::from(u16::from_be_bytes(take_array::<2>(buf)?));
    if buf.remaining() < len {
        return Err(SecurityError::malformed("token truncated"));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| SecurityError::malformed("name is not UTF-8"))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn expect_end(buf: &[u8]) -> SecurityResult<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(SecurityError::malformed("trailing bytes in token"))
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// HMAC-SHA256 of `label` and the length-prefixed `parts`.
fn derive(key: &[u8], label: &[u8], parts: &[&[u8]]) -> SecurityResult<Zeroizing<[u8; MAC_LEN]>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| SecurityError::authentication("invalid key length"))?;
    mac.update(label);
    for part in parts {
        // Token parts are bounded by the maximum message size.
        #[allow(clippy::cast_possible_truncation)]
        mac.update(&(part.len() as u32).to_be_bytes());
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; MAC_LEN]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn verify_proof(expected: &[u8; MAC_LEN], got: &[u8], who: &str) -> SecurityResult<()> {
    if bool::from(expected.as_slice().ct_eq(got)) {
        Ok(())
    } else {
        Err(SecurityError::authentication(format!("{who} proof mismatch")))
    }
}

/// Per-direction AEAD state.
struct Session {
    send: Aes256Gcm,
    recv: Aes256Gcm,
    send_seq: u64,
    recv_seq: u64,
}

impl Session {
    fn new(key: &[u8], transcript: &[&[u8]], initiator: bool) -> SecurityResult<Self> {
        let i2a = derive(key, LABEL_INITIATOR_TO_ACCEPTOR, transcript)?;
        let a2i = derive(key, LABEL_ACCEPTOR_TO_INITIATOR, transcript)?;
        let (send_key, recv_key) = if initiator { (&i2a, &a2i) } else { (&a2i, &i2a) };
        let cipher = |k: &[u8]| {
            Aes256Gcm::new_from_slice(k)
                .map_err(|_| SecurityError::integrity("invalid session key length"))
        };
        Ok(Self {
            send: cipher(send_key.as_slice())?,
            recv: cipher(recv_key.as_slice())?,
            send_seq: 0,
            recv_seq: 0,
        })
    }

    fn nonce(seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    fn seal(&mut self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        let seq = self.send_seq;
        self.send_seq = seq
            .checked_add(1)
            .ok_or_else(|| SecurityError::integrity("send sequence exhausted"))?;
        let ciphertext = self
            .send
            .encrypt(Nonce::<Aes256Gcm>::from_slice(&Self::nonce(seq)), plaintext)
            .map_err(|_| SecurityError::integrity("encryption failed"))?;

        let mut out = Vec::with_capacity(SEQ_LEN + ciphertext.len());
        out.put_u64(seq);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&mut self, wrapped: &[u8]) -> SecurityResult<Vec<u8>> {
        if wrapped.len() < SEQ_LEN + TAG_LEN {
            return Err(SecurityError::integrity("wrapped message truncated"));
        }
        let (seq_bytes, ciphertext) = wrapped.split_at(SEQ_LEN);
        let mut seq_buf = seq_bytes;
        let seq = seq_buf.get_u64();
        if seq != self.recv_seq {
            return Err(SecurityError::integrity(format!(
                "out-of-sequence message: expected {} got {seq}",
                self.recv_seq
            )));
        }
        let plaintext = self
            .recv
            .decrypt(Nonce::<Aes256Gcm>::from_slice(&Self::nonce(seq)), ciphertext)
            .map_err(|_| SecurityError::integrity("authentication tag mismatch"))?;
        self.recv_seq += 1;
        Ok(plaintext)
    }
}

enum InitiatorState {
    Start,
    AwaitReply { init: Vec<u8> },
    Done,
}

/// Initiator side of the pre-shared-key mechanism.
pub struct PskInitiator {
    principal: String,
    key: Key,
    target: String,
    requested: SecurityFlags,
    state: InitiatorState,
    granted: SecurityFlags,
    session: Option<Session>,
}

impl PskInitiator {
    /// Create an initiator that authenticates as `principal` to `target`
    /// and requests every service.
    #[must_use]
    pub fn new(principal: impl Into<String>, key: Key, target: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            key,
            target: target.into(),
            requested: SecurityFlags::ALL,
            state: InitiatorState::Start,
            granted: SecurityFlags::NONE,
            session: None,
        }
    }

    /// Create an initiator from a key table entry.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Keytab`] if no usable entry exists.
    pub fn from_keytab(
        keytab: &Keytab,
        principal: Option<&str>,
        target: impl Into<String>,
    ) -> SecurityResult<Self> {
        let (name, key) = keytab.credential(principal)?;
        Ok(Self::new(name, key.clone(), target))
    }

    /// Override the services requested from the acceptor.
    #[must_use]
    pub fn with_requested(mut self, flags: SecurityFlags) -> Self {
        self.requested = flags;
        self
    }

    fn initial_token(&mut self) -> SecurityResult<Step> {
        let init = InitToken {
            flags: self.requested,
            nonce: random_nonce(),
            principal: self.principal.clone(),
            target: self.target.clone(),
        }
        .encode()?;
        self.state = InitiatorState::AwaitReply { init: init.clone() };
        Ok(Step::continue_with(init))
    }

    fn process_reply(&mut self, init: &[u8], reply: &[u8]) -> SecurityResult<Step> {
        if reply.len() < MAC_LEN {
            return Err(SecurityError::malformed("token truncated"));
        }
        let (body, proof) = reply.split_at(reply.len() - MAC_LEN);
        let mut buf = body;
        expect_header(&mut buf, KIND_REPLY)?;
        let granted = SecurityFlags::from_bits_truncate(take_u32(&mut buf)?);
        let _server_nonce = take_array::<NONCE_LEN>(&mut buf)?;
        expect_end(buf)?;

        let transcript = [init, body];
        let expected = derive(self.key.as_slice(), LABEL_ACCEPTOR_PROOF, &transcript)?;
        verify_proof(&expected, proof, "acceptor")?;
        if !self.requested.contains(granted) {
            return Err(SecurityError::authentication(
                "acceptor granted services that were not requested",
            ));
        }
        // The acceptor proved knowledge of our key.
        let provided = SESSION_SERVICES.union(SecurityFlags::MUTUAL);

        let own_proof = derive(self.key.as_slice(), LABEL_INITIATOR_PROOF, &transcript)?;
        self.session = Some(Session::new(self.key.as_slice(), &transcript, true)?);
        self.granted = granted.intersection(provided);
        self.state = InitiatorState::Done;

        let mut token = Vec::with_capacity(2 + MAC_LEN);
        token.put_u8(VERSION);
        token.put_u8(KIND_PROOF);
        token.put_slice(own_proof.as_slice());
        Ok(Step::complete(Some(token)))
    }
}

impl Mechanism for PskInitiator {
    fn step(&mut self, input: Option<&[u8]>) -> SecurityResult<Step> {
        match (std::mem::replace(&mut self.state, InitiatorState::Done), input) {
            (InitiatorState::Start, None) => self.initial_token(),
            (InitiatorState::AwaitReply { init }, Some(reply)) => self.process_reply(&init, reply),
            _ => Err(SecurityError::InvalidState {
                reason: "initiator token out of sequence",
            }),
        }
    }

    fn flags(&self) -> SecurityFlags {
        if self.session.is_some() {
            self.granted
        } else {
            SecurityFlags::NONE
        }
    }

    fn peer_principal(&self) -> Option<&str> {
        self.session.as_ref().map(|_| self.target.as_str())
    }

    fn wrap(&mut self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        self.session
            .as_mut()
            .ok_or(SecurityError::NotEstablished)?
            .seal(plaintext)
    }

    fn unwrap(&mut self, wrapped: &[u8]) -> SecurityResult<Vec<u8>> {
        self.session
            .as_mut()
            .ok_or(SecurityError::NotEstablished)?
            .open(wrapped)
    }
}

enum AcceptorState {
    Start,
    AwaitProof {
        key: Key,
        client: String,
        offered: SecurityFlags,
        init: Vec<u8>,
        reply_body: Vec<u8>,
    },
    Done,
}

/// Acceptor side of the pre-shared-key mechanism.
pub struct PskAcceptor {
    keytab: Arc<Keytab>,
    service: String,
    state: AcceptorState,
    peer: Option<String>,
    granted: SecurityFlags,
    session: Option<Session>,
}

impl PskAcceptor {
    /// Create an acceptor for `service` (e.g. `ceod@host`) that
    /// authenticates clients listed in `keytab`.
    #[must_use]
    pub fn new(keytab: Arc<Keytab>, service: impl Into<String>) -> Self {
        Self {
            keytab,
            service: service.into(),
            state: AcceptorState::Start,
            peer: None,
            granted: SecurityFlags::NONE,
            session: None,
        }
    }

    fn process_init(&mut self, token: &[u8]) -> SecurityResult<Step> {
        let init = InitToken::decode(token)?;
        if init.target != self.service {
            return Err(SecurityError::authentication(format!(
                "token is for {}, this is {}",
                init.target, self.service
            )));
        }
        let key = self
            .keytab
            .get(&init.principal)
            .ok_or_else(|| {
                SecurityError::authentication(format!("unknown principal {}", init.principal))
            })?
            .clone();

        let offered = init
            .flags
            .intersection(SESSION_SERVICES.union(SecurityFlags::MUTUAL));
        let mut reply_body = Vec::with_capacity(2 + 4 + NONCE_LEN);
        reply_body.put_u8(VERSION);
        reply_body.put_u8(KIND_REPLY);
        reply_body.put_u32(offered.bits());
        reply_body.put_slice(&random_nonce());

        let proof = derive(key.as_slice(), LABEL_ACCEPTOR_PROOF, &[token, &reply_body])?;
        let mut reply = reply_body.clone();
        reply.extend_from_slice(proof.as_slice());

        self.state = AcceptorState::AwaitProof {
            key,
            client: init.principal,
            offered,
            init: token.to_vec(),
            reply_body,
        };
        Ok(Step::continue_with(reply))
    }
}

impl Mechanism for PskAcceptor {
    fn step(&mut self, input: Option<&[u8]>) -> SecurityResult<Step> {
        match (std::mem::replace(&mut self.state, AcceptorState::Done), input) {
            (AcceptorState::Start, Some(token)) => self.process_init(token),
            (
                AcceptorState::AwaitProof {
                    key,
                    client,
                    offered,
                    init,
                    reply_body,
                },
                Some(token),
            ) => {
                let mut buf = token;
                expect_header(&mut buf, KIND_PROOF)?;
                let transcript = [init.as_slice(), reply_body.as_slice()];
                let expected = derive(key.as_slice(), LABEL_INITIATOR_PROOF, &transcript)?;
                verify_proof(&expected, buf, "initiator")?;
                // The initiator sends its proof only after verifying ours.
                let provided = SESSION_SERVICES.union(SecurityFlags::MUTUAL);

                self.session = Some(Session::new(key.as_slice(), &transcript, false)?);
                self.granted = offered.intersection(provided);
                self.peer = Some(client);
                Ok(Step::complete(None))
            },
            _ => Err(SecurityError::InvalidState {
                reason: "acceptor token out of sequence",
            }),
        }
    }

    fn flags(&self) -> SecurityFlags {
        if self.session.is_some() {
            self.granted
        } else {
            SecurityFlags::NONE
        }
    }

    fn peer_principal(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    fn wrap(&mut self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        self.session
            .as_mut()
            .ok_or(SecurityError::NotEstablished)?
            .seal(plaintext)
    }

    fn unwrap(&mut self, wrapped: &[u8]) -> SecurityResult<Vec<u8>> {
        self.session
            .as_mut()
            .ok_or(SecurityError::NotEstablished)?
            .open(wrapped)
    }
}
