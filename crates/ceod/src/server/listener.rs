//! Blocking listening socket for the master.
//!
//! The standard library's listener retries `accept` on `EINTR`; the master
//! needs to see it so a termination signal ends the accept loop. Both
//! bindings share this listener: the message binding only changes the
//! socket protocol to SCTP.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn, accept4, getpeername,
    getsockname, listen, setsockopt, socket, sockopt,
};

use crate::protocol::TransportKind;

/// Listen queue length.
pub const BACKLOG: i32 = 128;

/// A bound, listening IPv4 socket.
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    /// Bind to `0.0.0.0:port` and listen.
    ///
    /// # Errors
    ///
    /// Returns the `socket`, `setsockopt`, `bind` or `listen` error.
    pub fn bind(kind: TransportKind, port: u16) -> io::Result<Self> {
        let fd = open_socket(kind)?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        nix::sys::socket::bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(BACKLOG)?)?;

        Ok(Self { fd })
    }

    /// Accept one connection.
    ///
    /// The returned descriptor is close-on-exec so operation subprocesses
    /// never inherit a client socket.
    ///
    /// # Errors
    ///
    /// Returns the `accept` error; [`io::ErrorKind::Interrupted`] when a
    /// signal arrived. A peer that reset before its address could be read
    /// yields [`io::ErrorKind::NotConnected`].
    #[allow(unsafe_code)]
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let raw = accept4(self.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC)?;
        // SAFETY: `accept4` returned a fresh descriptor that nothing else
        // owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let peer: SockaddrIn = getpeername(fd.as_raw_fd())?;
        Ok((fd, SocketAddr::V4(peer.into())))
    }

    /// Address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns the `getsockname` error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr: SockaddrIn = getsockname(self.fd.as_raw_fd())?;
        Ok(SocketAddr::V4(addr.into()))
    }
}

fn open_socket(kind: TransportKind) -> io::Result<OwnedFd> {
    match kind {
        TransportKind::Stream => Ok(socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::Tcp,
        )?),
        #[cfg(target_os = "linux")]
        TransportKind::Message => {
            crate::protocol::sctp::open_socket(AddressFamily::Inet, SockFlag::SOCK_CLOEXEC)
        },
        #[cfg(not(target_os = "linux"))]
        TransportKind::Message => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "message-oriented transport requires SCTP (Linux only)",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    use super::*;

    #[test]
    fn test_bind_accept_stream() {
        let listener = Listener::bind(TransportKind::Stream, 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (fd, peer) = listener.accept().unwrap();
        assert!(peer.ip().is_loopback());
        assert_eq!(peer, client.local_addr().unwrap());

        let flags = FdFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));

        let mut server = TcpStream::from(fd);
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_listener_is_close_on_exec() {
        let listener = Listener::bind(TransportKind::Stream, 0).unwrap();
        let flags =
            FdFlag::from_bits_truncate(fcntl(listener.fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_port_in_use_fails() {
        let first = Listener::bind(TransportKind::Stream, 0).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = Listener::bind(TransportKind::Stream, port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
