//! Message-oriented binding over one-to-one SCTP.
//!
//! The transport delimits records, so no header is written. The message type
//! travels as the payload protocol identifier (PPID) in an `SCTP_SNDRCV`
//! ancillary block, in network byte order.
//!
//! # Architecture
//!
//! The socket is non-blocking and registered with the tokio reactor through
//! [`AsyncFd`]. Each readable event drains at most [`BUFFER_INCREMENT`]
//! bytes; partial deliveries accumulate until the kernel flags `MSG_EOR`.
//!
//! Transport notifications (`MSG_NOTIFICATION`) are decoded in-line. A peer
//! shutdown between messages ends the connection like end-of-stream does;
//! association loss, or a shutdown in the middle of a record, is an error.
//! Anything else is logged and skipped.

use std::io::{self, ErrorKind};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use async_trait::async_trait;
use bytes::BytesMut;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, Shutdown, SockFlag, SockaddrStorage, connect, getsockopt, shutdown, sockopt,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use super::error::{BUFFER_INCREMENT, MAX_MESSAGE_SIZE, ProtocolError, ProtocolResult};
use super::framing::check_length;
use super::message::Message;
use super::transport::MessageTransport;

/// `SOL_SCTP` socket option level.
const SOL_SCTP: libc::c_int = 132;
/// `SCTP_EVENTS` socket option.
const SCTP_EVENTS: libc::c_int = 11;
/// `SCTP_SNDRCV` ancillary data type.
const SCTP_SNDRCV: libc::c_int = 1;
/// Set by `recvmsg` on notification records.
const MSG_NOTIFICATION: libc::c_int = 0x8000;

const SCTP_ASSOC_CHANGE: u16 = 0x8001;
const SCTP_PEER_ADDR_CHANGE: u16 = 0x8002;
const SCTP_SEND_FAILED: u16 = 0x8003;
const SCTP_REMOTE_ERROR: u16 = 0x8004;
const SCTP_SHUTDOWN_EVENT: u16 = 0x8005;
const SCTP_PARTIAL_DELIVERY_EVENT: u16 = 0x8006;

const SCTP_COMM_UP: u16 = 0;
const SCTP_COMM_LOST: u16 = 1;
const SCTP_RESTART: u16 = 2;
const SCTP_SHUTDOWN_COMP: u16 = 3;
const SCTP_CANT_STR_ASSOC: u16 = 4;

/// Kernel `struct sctp_sndrcvinfo`. Only the PPID is read or written.
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, Default)]
struct SndRcvInfo {
    stream: u16,
    ssn: u16,
    flags: u16,
    ppid: u32,
    context: u32,
    timetolive: u32,
    tsn: u32,
    cumtsn: u32,
    assoc_id: i32,
}

// `sizeof(struct sctp_sndrcvinfo)`; always fits a c_uint.
#[allow(clippy::cast_possible_truncation)]
const SNDRCV_LEN: libc::c_uint = mem::size_of::<SndRcvInfo>() as libc::c_uint;

/// Control buffer large enough for one `SCTP_SNDRCV` block, 8-byte aligned.
type ControlBuf = [u64; 8];

/// A decoded SCTP transport notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Association state changed.
    AssocChange {
        /// `sac_state`.
        state: u16,
        /// `sac_error`.
        error: u16,
    },
    /// A peer address changed reachability.
    PeerAddrChange,
    /// A message could not be delivered.
    SendFailed {
        /// `ssf_error`.
        error: u32,
    },
    /// The peer reported an operational error.
    RemoteError {
        /// `sre_error`, host byte order.
        error: u16,
    },
    /// The peer started a graceful shutdown.
    Shutdown,
    /// A partial delivery was aborted.
    PartialDeliveryAborted,
    /// Any notification not decoded above.
    Other {
        /// `sn_type`.
        kind: u16,
    },
}

impl Notification {
    /// Decode a notification record.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidData`] if the record is shorter than the
    /// fields it claims to carry.
    pub fn parse(buf: &[u8]) -> io::Result<Self> {
        let kind = read_u16_ne(buf, 0)?;
        Ok(match kind {
            SCTP_ASSOC_CHANGE => Self::AssocChange {
                state: read_u16_ne(buf, 8)?,
                error: read_u16_ne(buf, 10)?,
            },
            SCTP_PEER_ADDR_CHANGE => Self::PeerAddrChange,
            SCTP_SEND_FAILED => Self::SendFailed {
                error: read_u32_ne(buf, 8)?,
            },
            SCTP_REMOTE_ERROR => Self::RemoteError {
                error: u16::from_be_bytes(read_array(buf, 8)?),
            },
            SCTP_SHUTDOWN_EVENT => Self::Shutdown,
            SCTP_PARTIAL_DELIVERY_EVENT => Self::PartialDeliveryAborted,
            kind => Self::Other { kind },
        })
    }

    /// Returns `true` if the association cannot carry further messages.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::AssocChange { state, .. } => matches!(
                *state,
                SCTP_COMM_LOST | SCTP_SHUTDOWN_COMP | SCTP_CANT_STR_ASSOC
            ),
            Self::Shutdown => true,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::AssocChange { state, error } => {
                let name = match *state {
                    SCTP_COMM_UP => "COMM_UP",
                    SCTP_COMM_LOST => "COMM_LOST",
                    SCTP_RESTART => "RESTART",
                    SCTP_SHUTDOWN_COMP => "SHUTDOWN_COMP",
                    SCTP_CANT_STR_ASSOC => "CANT_STR_ASSOC",
                    _ => "UNKNOWN",
                };
                format!("association change {name} (error {error})")
            },
            Self::PeerAddrChange => "peer address change".to_string(),
            Self::SendFailed { error } => format!("send failed (error {error})"),
            Self::RemoteError { error } => format!("remote error {error}"),
            Self::Shutdown => "peer shutdown".to_string(),
            Self::PartialDeliveryAborted => "partial delivery aborted".to_string(),
            Self::Other { kind } => format!("notification {kind:#x}"),
        }
    }
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> io::Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "truncated SCTP notification"))
}

fn read_u16_ne(buf: &[u8], offset: usize) -> io::Result<u16> {
    read_array(buf, offset).map(u16::from_ne_bytes)
}

fn read_u32_ne(buf: &[u8], offset: usize) -> io::Result<u32> {
    read_array(buf, offset).map(u32::from_ne_bytes)
}

/// Outcome of a single `recvmsg` call.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    len: usize,
    flags: libc::c_int,
    ppid: Option<u32>,
}

/// What a received chunk completed.
#[derive(Debug)]
enum Delivery {
    /// More chunks are needed.
    Pending,
    /// A whole data record.
    Message(Message),
    /// The peer shut the association down between messages.
    Closed,
}

/// Reassembles partially delivered data and notification records.
#[derive(Debug, Default)]
struct RecordAssembler {
    partial: BytesMut,
    partial_ppid: Option<u32>,
    notification: BytesMut,
}

impl RecordAssembler {
    /// Feed one received chunk.
    fn push(&mut self, chunk: Chunk, data: &[u8]) -> ProtocolResult<Delivery> {
        let end_of_record = chunk.flags & libc::MSG_EOR != 0;

        if chunk.flags & MSG_NOTIFICATION != 0 {
            append_bounded(&mut self.notification, data)?;
            if end_of_record && self.complete_notification()? {
                return Ok(Delivery::Closed);
            }
            return Ok(Delivery::Pending);
        }

        append_bounded(&mut self.partial, data)?;
        if self.partial_ppid.is_none() {
            self.partial_ppid = chunk.ppid;
        }
        if end_of_record {
            return self.complete_record().map(Delivery::Message);
        }
        Ok(Delivery::Pending)
    }

    /// The socket reported end-of-stream.
    fn end_of_stream(&self) -> ProtocolResult<Option<Message>> {
        if self.partial.is_empty() && self.notification.is_empty() {
            Ok(None)
        } else {
            Err(ProtocolError::ConnectionClosed {
                during: "inside a message",
            })
        }
    }

    fn complete_record(&mut self) -> ProtocolResult<Message> {
        let payload = self.partial.split().freeze();
        let msg_type = self.partial_ppid.take().ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidData, "SCTP record without SCTP_SNDRCV data")
        })?;
        check_length(payload.len())?;
        Ok(Message { msg_type, payload })
    }

    /// Handle a complete notification record. Returns `true` if the peer
    /// shut the association down between messages.
    fn complete_notification(&mut self) -> ProtocolResult<bool> {
        let record = self.notification.split();
        let event = Notification::parse(&record)?;
        if event == Notification::Shutdown && self.partial.is_empty() {
            debug!("SCTP peer shutdown");
            return Ok(true);
        }
        if event.is_fatal() {
            return Err(ProtocolError::AssociationTerminated {
                event: event.describe(),
            });
        }
        match event {
            Notification::AssocChange { .. } | Notification::PeerAddrChange => {
                debug!(event = %event.describe(), "SCTP notification");
            },
            _ => warn!(event = %event.describe(), "SCTP notification"),
        }
        Ok(false)
    }
}

fn append_bounded(buf: &mut BytesMut, data: &[u8]) -> ProtocolResult<()> {
    let total = buf.len() + data.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::message_too_large(total));
    }
    buf.extend_from_slice(data);
    Ok(())
}

/// [`MessageTransport`] over a connected one-to-one SCTP socket.
#[derive(Debug)]
pub struct SctpTransport {
    fd: AsyncFd<OwnedFd>,
    assembler: RecordAssembler,
}

impl SctpTransport {
    /// Wrap an already connected SCTP socket.
    ///
    /// # Errors
    ///
    /// Fails if the socket options cannot be set or the reactor rejects the
    /// descriptor.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        subscribe_events(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            assembler: RecordAssembler::default(),
        })
    }

    /// Open a new association to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the socket or connect error; `EPROTONOSUPPORT` if the kernel
    /// has no SCTP support.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let family = if addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        let fd = open_socket(family, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC)?;
        let in_progress = match connect(fd.as_raw_fd(), &SockaddrStorage::from(addr)) {
            Ok(()) => false,
            Err(Errno::EINPROGRESS) => true,
            Err(e) => return Err(e.into()),
        };

        let transport = Self::from_fd(fd)?;
        if in_progress {
            let guard = transport.fd.writable().await?;
            drop(guard);
            let err = getsockopt(transport.fd.get_ref(), sockopt::SocketError)?;
            if err != 0 {
                return Err(io::Error::from_raw_os_error(err));
            }
        }
        Ok(transport)
    }
}

#[async_trait]
impl MessageTransport for SctpTransport {
    async fn send(&mut self, msg: Message) -> ProtocolResult<()> {
        check_length(msg.payload.len())?;
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_record(inner.get_ref().as_raw_fd(), &msg)) {
                Ok(result) => return result.map_err(Into::into),
                Err(_would_block) => {},
            }
        }
    }

    async fn recv(&mut self) -> ProtocolResult<Option<Message>> {
        let mut buf = [0u8; BUFFER_INCREMENT];
        loop {
            let chunk = {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| recv_chunk(inner.get_ref().as_raw_fd(), &mut buf)) {
                    Ok(result) => result?,
                    Err(_would_block) => continue,
                }
            };

            if chunk.len == 0 {
                return self.assembler.end_of_stream();
            }
            match self.assembler.push(chunk, &buf[..chunk.len])? {
                Delivery::Pending => {},
                Delivery::Message(msg) => return Ok(Some(msg)),
                Delivery::Closed => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> ProtocolResult<()> {
        shutdown(self.fd.get_ref().as_raw_fd(), Shutdown::Write).map_err(io::Error::from)?;
        Ok(())
    }
}

/// Create an SCTP one-to-one socket.
///
/// `nix` has no SCTP [`SockProtocol`](nix::sys::socket::SockProtocol), so
/// this is the one socket created through `libc` directly.
///
/// # Errors
///
/// Returns the `socket` error; `EPROTONOSUPPORT` without kernel SCTP.
#[allow(unsafe_code)]
pub fn open_socket(family: AddressFamily, flags: SockFlag) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall with integer arguments.
    let fd = unsafe {
        libc::socket(
            family as libc::c_int,
            libc::SOCK_STREAM | flags.bits(),
            libc::IPPROTO_SCTP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `socket` returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Enable per-message `SCTP_SNDRCV` data and the notifications we act on.
///
/// Order follows `struct sctp_event_subscribe`: data I/O, association,
/// address, send failure, peer error, shutdown, partial delivery,
/// adaptation layer. `nix` has no `SCTP_EVENTS` option, hence `libc`.
#[allow(unsafe_code)]
fn subscribe_events(fd: &OwnedFd) -> io::Result<()> {
    let events: [u8; 8] = [1, 1, 1, 1, 1, 1, 1, 0];
    // SAFETY: `events` outlives the call and its length is passed alongside.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_SCTP,
            SCTP_EVENTS,
            events.as_ptr().cast(),
            events.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send one record with its type in an `SCTP_SNDRCV` control block.
///
/// `nix`'s `ControlMessage` cannot carry `SCTP_SNDRCV`, so the message
/// header is built by hand.
#[allow(unsafe_code)]
fn send_record(fd: RawFd, msg: &Message) -> io::Result<()> {
    let info = SndRcvInfo {
        ppid: msg.msg_type.to_be(),
        ..SndRcvInfo::default()
    };
    let mut control: ControlBuf = [0; 8];
    let mut iov = libc::iovec {
        iov_base: msg.payload.as_ptr().cast_mut().cast(),
        iov_len: msg.payload.len(),
    };

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    // SAFETY: CMSG_SPACE is pure arithmetic.
    hdr.msg_controllen = unsafe { libc::CMSG_SPACE(SNDRCV_LEN) } as _;

    // SAFETY: the control buffer holds CMSG_SPACE(SNDRCV_LEN) bytes, so the
    // first header is non-null and its data area fits a SndRcvInfo.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&hdr);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small"));
        }
        (*cmsg).cmsg_level = SOL_SCTP;
        (*cmsg).cmsg_type = SCTP_SNDRCV;
        (*cmsg).cmsg_len = libc::CMSG_LEN(SNDRCV_LEN) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<SndRcvInfo>(), info);
    }

    // SAFETY: `hdr` points at `iov` and `control`, both alive for the call.
    // The kernel only reads the payload through the iovec.
    let sent = unsafe { libc::sendmsg(fd, &hdr, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent.unsigned_abs() != msg.payload.len() {
        return Err(io::Error::new(ErrorKind::WriteZero, "partial SCTP record sent"));
    }
    Ok(())
}

/// Receive one chunk and the PPID from its `SCTP_SNDRCV` block, if any.
///
/// Uses `libc` for the same reason as [`send_record`].
#[allow(unsafe_code)]
fn recv_chunk(fd: RawFd, buf: &mut [u8]) -> io::Result<Chunk> {
    let mut control: ControlBuf = [0; 8];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    hdr.msg_controllen = mem::size_of::<ControlBuf>() as _;

    // SAFETY: `iov` covers exactly `buf` and `control` is sized as
    // declared; both outlive the call.
    let received = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ppid = None;
    // SAFETY: the kernel filled msg_control/msg_controllen; the CMSG macros
    // stay within that region.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == SOL_SCTP && (*cmsg).cmsg_type == SCTP_SNDRCV {
                let info = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<SndRcvInfo>());
                ppid = Some(u32::from_be(info.ppid));
            }
            cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
        }
    }

    Ok(Chunk {
        len: received.unsigned_abs(),
        flags: hdr.msg_flags,
        ppid,
    })
}
