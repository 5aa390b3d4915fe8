use bytes::{Buf, BytesMut};
use serde::Serialize;
use tracing::{debug, trace};

use crate::codec::{
    detect_and_validate, inspect, is_magic, CodecConfig, CrcStatus, Decoded, DecodedFrame, Header,
    Inspection,
};
use crate::error::FrameError;
use crate::message::MessageTable;

/// Counters kept by a [`Deframer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeframeStats {
    /// Frames handed out.
    pub frames: u64,
    /// Checksum failures, whether or not checking is enforced.
    pub crc_errors: u64,
    /// Frames rejected for an unknown message id.
    pub unknown: u64,
    /// Frames rejected for unsupported incompatibility flags.
    pub unsupported: u64,
    /// Frames accepted without a definition to verify against.
    pub unverified: u64,
}

/// Stateful driver of the stateless codec for one byte stream.
///
/// A corrupt frame is counted once, when the stream first loses sync. The
/// candidates tried while hunting for the next frame (stray magic bytes
/// inside the corrupt data) are discarded without being counted again, and
/// while hunting the deframer may skip straight to a later complete frame
/// instead of waiting for an incomplete stray candidate to fill up.
///
/// While hunting, a frame with an unknown message id has no checksum seed to
/// vouch for it. If the stream passes unknown ids through, such a frame is
/// still accepted when its extent ends exactly at the end of the buffered
/// data or at the start of another plausible frame; otherwise it is treated
/// as noise.
#[derive(Debug, Clone)]
pub struct Deframer {
    config: CodecConfig,
    hunting: CodecConfig,
    resyncing: bool,
    stats: DeframeStats,
}

impl Deframer {
    pub fn new(config: CodecConfig) -> Self {
        let hunting = CodecConfig {
            accept_unknown: false,
            ..config.clone()
        };
        Self {
            config,
            hunting,
            resyncing: false,
            stats: DeframeStats::default(),
        }
    }

    /// Pull the next accepted frame out of `src`, or `None` when `src`
    /// holds no complete frame.
    pub fn next_frame(
        &mut self,
        src: &mut BytesMut,
        table: &dyn MessageTable,
    ) -> Option<DecodedFrame> {
        loop {
            let lenient = !self.resyncing || self.unknown_frame_at_front(src, table);
            let config = if lenient { &self.config } else { &self.hunting };
            match detect_and_validate(src, table, config) {
                Decoded::Valid { frame, .. } => {
                    self.resyncing = false;
                    self.stats.frames += 1;
                    match frame.message.crc {
                        CrcStatus::Verified => {}
                        CrcStatus::Ignored => self.stats.crc_errors += 1,
                        CrcStatus::Unverified => self.stats.unverified += 1,
                    }
                    return Some(frame);
                }
                Decoded::Invalid(err) => {
                    if !self.resyncing {
                        self.count_rejection(&err);
                        self.resyncing = true;
                    } else {
                        trace!(error = %err, "discarding stray frame candidate");
                    }
                }
                Decoded::Incomplete => {
                    if self.resyncing && !src.is_empty() && self.skip_to_next_frame(src, table) {
                        continue;
                    }
                    return None;
                }
            }
        }
    }

    fn count_rejection(&mut self, err: &FrameError) {
        match err {
            FrameError::ChecksumMismatch { .. } => self.stats.crc_errors += 1,
            FrameError::UnknownMessage(_) => self.stats.unknown += 1,
            _ => self.stats.unsupported += 1,
        }
        debug!(error = %err, "frame rejected, resynchronizing");
    }

    /// Align `src` on its first magic byte and report whether the candidate
    /// there is an unknown-id frame that may pass while hunting.
    fn unknown_frame_at_front(&self, src: &mut BytesMut, table: &dyn MessageTable) -> bool {
        if !self.config.accept_unknown {
            return false;
        }
        match src.iter().position(|&b| is_magic(b)) {
            Some(skip) => src.advance(skip),
            None => return false,
        }
        self.is_corroborated_unknown(src, table)
    }

    fn is_corroborated_unknown(&self, buf: &[u8], table: &dyn MessageTable) -> bool {
        if !self.config.accept_unknown
            || !matches!(
                inspect(buf, table, &self.hunting),
                Inspection::Reject(FrameError::UnknownMessage(_))
            )
        {
            return false;
        }
        let Some(header) = Header::parse(buf) else {
            return false;
        };

        match buf.get(header.frame_len()..) {
            Some([]) => true,
            Some(rest) => {
                is_magic(rest[0])
                    && !matches!(inspect(rest, table, &self.hunting), Inspection::Reject(_))
            }
            None => false,
        }
    }

    /// Drop the stray candidate at the front if a complete, verified frame
    /// (or a corroborated unknown one) starts later in the buffer.
    fn skip_to_next_frame(&self, src: &mut BytesMut, table: &dyn MessageTable) -> bool {
        let found = (1..src.len()).find(|&at| {
            is_magic(src[at])
                && (matches!(
                    inspect(&src[at..], table, &self.hunting),
                    Inspection::Accept {
                        crc: CrcStatus::Verified,
                        ..
                    }
                ) || self.is_corroborated_unknown(&src[at..], table))
        });

        match found {
            Some(at) => {
                trace!(skip = at, "skipping incomplete stray candidate");
                src.advance(at);
                true
            }
            None => false,
        }
    }

    /// Whether the stream is currently hunting for the next frame.
    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    pub fn stats(&self) -> &DeframeStats {
        &self.stats
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}
