use std::io::{ErrorKind, Read};
use std::sync::Arc;

use bytes::BytesMut;

use crate::codec::{CodecConfig, DecodedFrame};
use crate::deframer::{DeframeStats, Deframer};
use crate::error::{FrameError, Result};
use crate::message::{MessageRegistry, MessageTable};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Reads complete MAVLink frames from any `Read` stream.
///
/// Handles partial reads and corrupt data internally: callers only ever see
/// accepted frames. Meant for offline decoding of captures; the router's
/// endpoints drive the same [`Deframer`] from non-blocking descriptors.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    deframer: Deframer,
    table: Arc<dyn MessageTable>,
}

impl<T: Read> FrameReader<T> {
    /// Create a reader using the built-in common message set.
    pub fn new(inner: T) -> Self {
        Self::with_config(
            inner,
            Arc::new(MessageRegistry::common()),
            CodecConfig::default(),
        )
    }

    /// Create a reader with an explicit message table and codec policy.
    pub fn with_config(inner: T, table: Arc<dyn MessageTable>, config: CodecConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            deframer: Deframer::new(config),
            table,
        }
    }

    /// Read the next accepted frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` at end of stream, even if
    /// a partial frame was left over.
    pub fn read_frame(&mut self) -> Result<DecodedFrame> {
        loop {
            if let Some(frame) = self.deframer.next_frame(&mut self.buf, self.table.as_ref()) {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &DeframeStats {
        self.deframer.stats()
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Iterator for FrameReader<T> {
    type Item = Result<DecodedFrame>;

    /// Yields frames until the stream ends; a clean end of stream finishes
    /// the iteration instead of yielding `ConnectionClosed`.
    fn next(&mut self) -> Option<Self::Item> {
        match self.read_frame() {
            Ok(frame) => Some(Ok(frame)),
            Err(FrameError::ConnectionClosed) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
