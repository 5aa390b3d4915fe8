use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{is_would_block, Transport, TransportKind};

/// How long an outgoing connection attempt may block before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected, non-blocking TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to a remote TCP server.
    ///
    /// The connect itself blocks for at most [`DEFAULT_CONNECT_TIMEOUT`];
    /// the returned stream is non-blocking.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, DEFAULT_CONNECT_TIMEOUT)
            .map_err(|source| TransportError::Connect { addr, source })?;
        debug!(%addr, "connected tcp endpoint");
        Self::from_stream(stream)
    }

    /// Wrap an already-connected stream, switching it to non-blocking mode.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    /// Address of the remote side.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsRawFd for TcpTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_raw(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn peer(&self) -> Option<String> {
        Some(self.peer.to_string())
    }
}

/// A non-blocking TCP listener producing [`TcpTransport`] connections.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpServer {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        info!(%local, "listening for tcp connections");

        Ok(Self { listener, local })
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is waiting.
    pub fn accept(&self) -> Result<Option<TcpTransport>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted tcp connection");
                TcpTransport::from_stream(stream).map(Some)
            }
            Err(err) if is_would_block(&err) => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp-listener"
    }
}

impl AsRawFd for TcpServer {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_accept_connect() {
        let server = TcpServer::bind(loopback()).unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let mut client = TcpTransport::connect(addr).unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(conn) = server.accept().unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut accepted = accepted.expect("connection should be accepted");
        assert_eq!(accepted.kind(), TransportKind::Tcp);

        assert_eq!(client.write_raw(b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            match accepted.read_raw(&mut buf[got..]) {
                Ok(n) => {
                    got += n;
                    if got == 5 {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("unexpected read error: {err}"),
            }
        }
        assert_eq!(&buf[..got], b"hello");
    }

    #[test]
    fn test_accept_without_pending_connection() {
        let server = TcpServer::bind(loopback()).unwrap();
        assert!(server.accept().unwrap().is_none());
    }

    #[test]
    fn test_read_would_block_when_idle() {
        let server = TcpServer::bind(loopback()).unwrap();
        let mut client = TcpTransport::connect(server.local_addr()).unwrap();

        let mut buf = [0u8; 8];
        let err = client.read_raw(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to obtain a port nobody listens on.
        let addr = {
            let server = TcpServer::bind(loopback()).unwrap();
            server.local_addr()
        };
        let result = TcpTransport::connect(addr);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
