use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportKind};

/// How a UDP endpoint chooses where to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    /// Bound to a well-known port; replies go to whoever sent last.
    Server,
    /// Bound to an ephemeral port; always sends to a fixed address.
    Client,
}

/// A non-blocking UDP socket carrying one MAVLink frame per datagram
/// (or several, when the sender packs them).
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    mode: UdpMode,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind a server socket on `addr`.
    ///
    /// No datagram can be sent until a peer has been heard from.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = bind_nonblocking(addr)?;
        info!(local = %socket.local_addr()?, "udp endpoint listening");
        Ok(Self {
            socket,
            mode: UdpMode::Server,
            peer: None,
        })
    }

    /// Create a client socket sending to `remote`.
    pub fn connect(remote: SocketAddr) -> Result<Self> {
        let unspecified = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = bind_nonblocking(SocketAddr::new(unspecified, 0))?;
        debug!(%remote, "udp endpoint sending to fixed peer");
        Ok(Self {
            socket,
            mode: UdpMode::Client,
            peer: Some(remote),
        })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current send target, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn mode(&self) -> UdpMode {
        self.mode
    }
}

fn bind_nonblocking(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| TransportError::Bind { addr, source })?;
    Ok(socket)
}

impl AsRawFd for UdpTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (n, from) = self.socket.recv_from(buf)?;
        if self.mode == UdpMode::Server && self.peer != Some(from) {
            debug!(peer = %from, "udp peer changed");
            self.peer = Some(from);
        }
        Ok(n)
    }

    fn write_raw(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.peer {
            Some(addr) => self.socket.send_to(buf, addr),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn can_send(&self) -> bool {
        self.peer.is_some()
    }

    fn peer(&self) -> Option<String> {
        self.peer.map(|addr| addr.to_string())
    }
}
