//! Non-blocking transports for MAVLink routing.
//!
//! Every transport hands the router a ready, non-blocking file descriptor
//! behind one small capability interface:
//! - Serial devices (termios raw mode)
//! - UDP sockets (server mode learns its peer, client mode sends to a fixed address)
//! - TCP streams (outgoing connections or connections accepted by [`TcpServer`])
//!
//! This is the lowest layer of mavrelay. Framing, buffering and dispatch live
//! in the crates built on top of the [`Transport`] trait provided here.

pub mod error;
pub mod serial;
pub mod tcp;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use serial::SerialTransport;
pub use tcp::{TcpServer, TcpTransport};
pub use traits::{is_would_block, Transport, TransportKind};
pub use udp::{UdpMode, UdpTransport};
