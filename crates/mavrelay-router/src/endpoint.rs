use std::fmt;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};

use bytes::{Buf, BytesMut};
use mavrelay_frame::{
    serialize, CodecConfig, DecodedFrame, Deframer, FrameError, Message, MessageTable, TrimPolicy,
};
use mavrelay_transport::{Transport, TransportKind};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::DeadReason;
use crate::poller::Interest;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const INITIAL_TX_CAPACITY: usize = 4 * 1024;

/// Reads attempted per readiness notification before yielding to other
/// descriptors. The poller is level-triggered, so leftovers are picked up
/// on the next pass.
const MAX_READS_PER_CALL: usize = 16;

/// Per-endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Name used in logs and statistics.
    pub name: String,
    /// Reject frames with bad checksums. Failures are counted either way.
    pub check_crc: bool,
    /// Upper bound on bytes waiting in the transmit buffer. A frame that
    /// would grow a non-empty buffer past this is dropped.
    pub max_pending_tx: usize,
    /// Trimming applied to messages serialized by this endpoint.
    pub trim_outgoing: TrimPolicy,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".to_string(),
            check_crc: true,
            max_pending_tx: 64 * 1024,
            trim_outgoing: TrimPolicy::default(),
        }
    }
}

/// Receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadStats {
    pub bytes: u64,
    pub messages: u64,
    pub crc_errors: u64,
    pub unknown: u64,
    pub unsupported: u64,
    pub unverified: u64,
}

/// Transmit-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub bytes: u64,
    pub messages: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub read: ReadStats,
    pub write: WriteStats,
}

/// Outcome of handing a frame to an endpoint for transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fully written to the transport.
    Sent,
    /// Partly or wholly buffered; the rest goes out once the transport is
    /// writable again.
    Queued,
    /// Not sent and not buffered.
    Dropped,
}

/// One transport plus the buffers and codec state that turn its bytes into
/// frames.
pub struct Endpoint {
    name: String,
    transport: Box<dyn Transport>,
    rx_buf: BytesMut,
    tx_buf: BytesMut,
    deframer: Deframer,
    trim: TrimPolicy,
    max_pending_tx: usize,
    read_bytes: u64,
    write: WriteStats,
    writable_requested: bool,
    dead: Option<DeadReason>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, transport: Box<dyn Transport>) -> Self {
        let codec = CodecConfig {
            check_crc: config.check_crc,
            trim: config.trim_outgoing,
            ..CodecConfig::default()
        };
        Self {
            name: config.name,
            transport,
            rx_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            tx_buf: BytesMut::with_capacity(INITIAL_TX_CAPACITY),
            deframer: Deframer::new(codec),
            trim: config.trim_outgoing,
            max_pending_tx: config.max_pending_tx,
            read_bytes: 0,
            write: WriteStats::default(),
            writable_requested: false,
            dead: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> EndpointStats {
        let deframe = self.deframer.stats();
        EndpointStats {
            read: ReadStats {
                bytes: self.read_bytes,
                messages: deframe.frames,
                crc_errors: deframe.crc_errors,
                unknown: deframe.unknown,
                unsupported: deframe.unsupported,
                unverified: deframe.unverified,
            },
            write: self.write,
        }
    }

    /// Bytes buffered for transmission.
    pub fn pending_tx(&self) -> usize {
        self.tx_buf.len()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    /// Mark the endpoint for eviction. The first reason wins.
    pub fn mark_dead(&mut self, reason: DeadReason) {
        if self.dead.is_none() {
            debug!(endpoint = %self.name, %reason, "endpoint marked dead");
            self.dead = Some(reason);
        }
    }

    pub(crate) fn take_dead(&mut self) -> Option<DeadReason> {
        self.dead.take()
    }

    /// Read what the transport has and yield the frames it completes.
    ///
    /// The sequence ends when the transport would block, after a bounded
    /// number of reads, or with a single `Err` when the transport died.
    /// Frames already buffered are always yielded before more is read.
    pub fn read_incoming<'a>(&'a mut self, table: &'a dyn MessageTable) -> Incoming<'a> {
        Incoming {
            endpoint: self,
            table,
            reads: 0,
            finished: false,
        }
    }

    /// Serialize `message` and send it.
    ///
    /// Errors only when the message cannot be encoded.
    pub fn enqueue_outgoing(
        &mut self,
        message: &Message,
        table: &dyn MessageTable,
    ) -> Result<Delivery, FrameError> {
        let mut frame = BytesMut::new();
        serialize(message, table, self.trim, &mut frame)?;
        Ok(self.enqueue_frame(&frame))
    }

    /// Send an already-encoded frame as is.
    ///
    /// Whatever the transport does not take immediately is buffered and
    /// writable interest is requested (see [`Endpoint::desired_interest`]).
    /// A fatal write error marks the endpoint dead and reports `Dropped`.
    pub fn enqueue_frame(&mut self, frame: &[u8]) -> Delivery {
        if self.dead.is_some() {
            return Delivery::Dropped;
        }
        if !self.transport.can_send() {
            trace!(endpoint = %self.name, "no destination yet, frame skipped");
            return Delivery::Dropped;
        }
        if self.transport.is_datagram() {
            return self.send_datagram(frame);
        }

        if !self.tx_buf.is_empty() && self.tx_buf.len() + frame.len() > self.max_pending_tx {
            self.write.dropped += 1;
            debug!(
                endpoint = %self.name,
                pending = self.tx_buf.len(),
                "transmit buffer full, frame dropped"
            );
            return Delivery::Dropped;
        }

        self.tx_buf.extend_from_slice(frame);
        match self.write_pending() {
            Ok(()) => {
                self.write.messages += 1;
                if self.tx_buf.is_empty() {
                    Delivery::Sent
                } else {
                    Delivery::Queued
                }
            }
            Err(reason) => {
                self.write.dropped += 1;
                self.mark_dead(reason);
                Delivery::Dropped
            }
        }
    }

    fn send_datagram(&mut self, frame: &[u8]) -> Delivery {
        loop {
            match self.transport.write_raw(frame) {
                Ok(n) => {
                    self.write.bytes += n as u64;
                    self.write.messages += 1;
                    return Delivery::Sent;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // A datagram is never split, and a refused or unroutable
                    // one does not make the socket unusable.
                    self.write.dropped += 1;
                    if err.kind() != ErrorKind::WouldBlock {
                        warn!(endpoint = %self.name, error = %err, "datagram send failed");
                    }
                    return Delivery::Dropped;
                }
            }
        }
    }

    /// Write buffered bytes now that the transport is writable.
    ///
    /// Returns how many bytes went out.
    pub fn flush_pending(&mut self) -> Result<usize, DeadReason> {
        let before = self.tx_buf.len();
        self.write_pending()?;
        Ok(before - self.tx_buf.len())
    }

    fn write_pending(&mut self) -> Result<(), DeadReason> {
        while !self.tx_buf.is_empty() {
            match self.transport.write_raw(&self.tx_buf) {
                Ok(0) => return Err(DeadReason::Closed),
                Ok(n) => {
                    self.tx_buf.advance(n);
                    self.write.bytes += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(DeadReason::Io(err)),
            }
        }
        Ok(())
    }

    /// Interest this endpoint needs registered: writable only while bytes
    /// are waiting.
    pub fn desired_interest(&self) -> Interest {
        if self.tx_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READ_WRITE
        }
    }

    /// The interest to apply if it differs from what was last applied.
    pub(crate) fn interest_change(&mut self) -> Option<Interest> {
        let interest = self.desired_interest();
        if interest.writable == self.writable_requested {
            return None;
        }
        self.writable_requested = interest.writable;
        debug!(
            endpoint = %self.name,
            writable = interest.writable,
            pending = self.tx_buf.len(),
            "backpressure state changed"
        );
        Some(interest)
    }

    fn fill_rx(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = self.transport.read_raw(&mut chunk)?;
        self.rx_buf.extend_from_slice(&chunk[..n]);
        self.read_bytes += n as u64;
        Ok(n)
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("rx_buffered", &self.rx_buf.len())
            .field("tx_pending", &self.tx_buf.len())
            .field("dead", &self.dead)
            .finish()
    }
}

/// Frames produced by one [`Endpoint::read_incoming`] call.
pub struct Incoming<'a> {
    endpoint: &'a mut Endpoint,
    table: &'a dyn MessageTable,
    reads: usize,
    finished: bool,
}

impl Iterator for Incoming<'_> {
    type Item = Result<DecodedFrame, DeadReason>;

    fn next(&mut self) -> Option<Self::Item> {
        let endpoint = &mut *self.endpoint;
        loop {
            if let Some(frame) = endpoint.deframer.next_frame(&mut endpoint.rx_buf, self.table) {
                trace!(
                    endpoint = %endpoint.name,
                    msgid = frame.message.msgid,
                    bytes = frame.raw.len(),
                    "frame received"
                );
                return Some(Ok(frame));
            }
            if self.finished || self.reads == MAX_READS_PER_CALL {
                return None;
            }

            self.reads += 1;
            match endpoint.fill_rx() {
                Ok(0) if !endpoint.transport.is_datagram() => {
                    self.finished = true;
                    return Some(Err(DeadReason::Closed));
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => self.finished = true,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(DeadReason::Io(err)));
                }
            }
        }
    }
}
