//! Telemetry log (".tlog") files.
//!
//! A tlog is a plain concatenation of records, each an 8-byte big-endian
//! timestamp in microseconds since the Unix epoch followed by one raw frame
//! exactly as it was received.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::codec::{detect_and_validate, is_magic, CodecConfig, Decoded, DecodedFrame, Header};
use crate::error::{FrameError, Result};
use crate::message::{MessageRegistry, MessageTable};

/// Size of the timestamp preceding every frame.
pub const TIMESTAMP_LEN: usize = 8;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Microseconds since the Unix epoch, as stamped on tlog records.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
}

/// Appends timestamped frames to a tlog stream.
pub struct TlogWriter<W: Write> {
    inner: W,
    records: u64,
}

impl TlogWriter<BufWriter<File>> {
    /// Create (or truncate) a tlog file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> TlogWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Write one record stamped with `timestamp_us`.
    pub fn write_record(&mut self, timestamp_us: u64, frame: &[u8]) -> Result<()> {
        self.inner.write_all(&timestamp_us.to_be_bytes())?;
        self.inner.write_all(frame)?;
        self.records += 1;
        Ok(())
    }

    /// Write one record stamped with the current wall-clock time.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_record(timestamp_now(), frame)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// One record read back from a tlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlogRecord {
    pub timestamp_us: u64,
    pub frame: DecodedFrame,
}

/// Reads records back out of a tlog stream.
///
/// Damaged records are skipped a byte at a time until a timestamp followed
/// by a valid frame lines up again; the number of bytes discarded this way
/// is available from [`TlogReader::skipped_bytes`].
pub struct TlogReader<T> {
    inner: T,
    buf: BytesMut,
    table: Arc<dyn MessageTable>,
    config: CodecConfig,
    skipped: u64,
}

impl TlogReader<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<T: Read> TlogReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_table(inner, Arc::new(MessageRegistry::common()))
    }

    pub fn with_table(inner: T, table: Arc<dyn MessageTable>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            table,
            config: CodecConfig::default(),
            skipped: 0,
        }
    }

    /// Read the next record, or `None` at end of file.
    ///
    /// A truncated record at the very end of the file is dropped silently.
    pub fn next_record(&mut self) -> Result<Option<TlogRecord>> {
        loop {
            if let Some(record) = self.take_record() {
                return Ok(Some(record));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };
            if read == 0 {
                if !self.buf.is_empty() {
                    trace!(bytes = self.buf.len(), "truncated record at end of tlog");
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn take_record(&mut self) -> Option<TlogRecord> {
        loop {
            if self.buf.len() <= TIMESTAMP_LEN {
                return None;
            }
            if !is_magic(self.buf[TIMESTAMP_LEN]) {
                self.skip_byte();
                continue;
            }

            let header = Header::parse(&self.buf[TIMESTAMP_LEN..])?;
            let record_len = TIMESTAMP_LEN + header.frame_len();
            if self.buf.len() < record_len {
                return None;
            }

            let mut frame_bytes = BytesMut::from(&self.buf[TIMESTAMP_LEN..record_len]);
            match detect_and_validate(&mut frame_bytes, self.table.as_ref(), &self.config) {
                Decoded::Valid { frame, .. } => {
                    let timestamp_us = self.buf.get_u64();
                    self.buf.advance(record_len - TIMESTAMP_LEN);
                    return Some(TlogRecord {
                        timestamp_us,
                        frame,
                    });
                }
                _ => self.skip_byte(),
            }
        }
    }

    fn skip_byte(&mut self) {
        self.buf.advance(1);
        self.skipped += 1;
    }

    /// Bytes discarded while realigning on damaged records.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }
}

impl<T: Read> Iterator for TlogReader<T> {
    type Item = Result<TlogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
