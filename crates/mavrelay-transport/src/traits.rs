use std::fmt;
use std::io;
use std::os::fd::AsRawFd;

/// The transport family an endpoint runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Serial,
    Udp,
    Tcp,
}

impl TransportKind {
    /// Short lowercase name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-blocking byte transport backed by one file descriptor.
///
/// Implementations never block: `read_raw` and `write_raw` return
/// `ErrorKind::WouldBlock` when the descriptor is not ready. A `read_raw`
/// returning `Ok(0)` on a stream transport means the remote side closed.
///
/// Framing and buffering are the caller's concern; nothing here knows about
/// MAVLink.
pub trait Transport: AsRawFd + fmt::Debug {
    /// Which transport family this is.
    fn kind(&self) -> TransportKind;

    /// Read whatever is available into `buf`.
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the descriptor accepts right now.
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether each write is delivered as one indivisible datagram.
    ///
    /// Datagram transports never see partial writes, so callers must not
    /// buffer a remainder for them.
    fn is_datagram(&self) -> bool {
        false
    }

    /// Whether the transport currently has somewhere to send to.
    fn can_send(&self) -> bool {
        true
    }

    /// Human-readable remote address, when there is one.
    fn peer(&self) -> Option<String> {
        None
    }
}

/// Classify an I/O error as "try again later".
pub fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
