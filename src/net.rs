//! Datagram transports.
//!
//! Two socket shapes are used by the daemon:
//!
//! - [`ResilientUdpSender`], a send-only socket that transparently re-opens
//!   itself after an error. Send failures are counted and reported to the
//!   caller but never poison the socket permanently.
//! - [`listener_socket`], a receive socket with a short read timeout so that
//!   receive loops can observe their cancellation token. Joins a multicast
//!   group when the configured address is multicast.

use crate::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Read timeout applied to receive sockets; bounds how long a receive loop
/// can ignore its cancellation token.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A UDP sender that re-opens its socket after any send error.
///
/// The socket is bound lazily on first send. On error the socket is dropped
/// so the next send starts from a fresh descriptor; the error itself is
/// still returned to the caller, which logs and counts it.
pub struct ResilientUdpSender {
    target: SocketAddr,
    socket: Option<UdpSocket>,
    send_errors: u64,
    broadcast: bool,
}

impl ResilientUdpSender {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            socket: None,
            send_errors: 0,
            broadcast: false,
        }
    }

    /// A sender for broadcast targets (sets `SO_BROADCAST` on open).
    pub fn broadcast(target: SocketAddr) -> Self {
        Self {
            target,
            socket: None,
            send_errors: 0,
            broadcast: true,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors
    }

    /// Send one datagram to the configured target.
    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        let socket = match self.socket.take() {
            Some(s) => s,
            None => self.open()?,
        };

        match socket.send_to(buf, self.target) {
            Ok(_) => {
                self.socket = Some(socket);
                Ok(())
            }
            Err(e) => {
                // Drop the socket; the next send re-opens it.
                self.send_errors += 1;
                Err(Error::Io(e))
            }
        }
    }

    fn open(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        if self.broadcast {
            socket.set_broadcast(true)?;
        }
        Ok(socket)
    }
}

/// Open a receive socket on `addr` with [`RECV_POLL_INTERVAL`] applied.
///
/// When `addr` is a multicast group, the socket binds the group's port on
/// all interfaces and joins the group.
pub fn listener_socket(addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = if addr.ip().is_multicast() {
        let s = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()))?;
        s.join_multicast_v4(addr.ip(), &Ipv4Addr::UNSPECIFIED)?;
        s
    } else {
        UdpSocket::bind(addr)?
    };
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    Ok(socket)
}

/// True when a receive error is the read timeout rather than a real failure.
pub fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Parse a `HOST:PORT` string into a socket address.
pub fn parse_addr(s: &str) -> Result<SocketAddrV4> {
    s.parse()
        .map_err(|_| Error::InvalidInput(format!("bad address {:?}", s)))
}
