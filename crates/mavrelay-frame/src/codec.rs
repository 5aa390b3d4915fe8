use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::trace;

use crate::crc::frame_checksum;
use crate::error::{FrameError, Result};
use crate::message::MessageTable;

/// Start-of-frame marker for MAVLink 1.
pub const MAGIC_V1: u8 = 0xFE;

/// Start-of-frame marker for MAVLink 2.
pub const MAGIC_V2: u8 = 0xFD;

/// MAVLink 1 header: magic, len, seq, sysid, compid, msgid.
pub const HEADER_LEN_V1: usize = 6;

/// MAVLink 2 header: magic, len, incompat, compat, seq, sysid, compid, msgid (3 bytes LE).
pub const HEADER_LEN_V2: usize = 10;

pub const CHECKSUM_LEN: usize = 2;

/// Trailing signature block of a signed MAVLink 2 frame.
pub const SIGNATURE_LEN: usize = 13;

/// Incompatibility flag announcing a signature block.
pub const IFLAG_SIGNED: u8 = 0x01;

pub const MAX_PAYLOAD_LEN: usize = 255;

/// Largest possible frame on the wire (signed MAVLink 2, full payload).
pub const MAX_FRAME_LEN: usize = HEADER_LEN_V2 + MAX_PAYLOAD_LEN + CHECKSUM_LEN + SIGNATURE_LEN;

/// Wire protocol version, identified by the magic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireVersion {
    V1,
    V2,
}

impl WireVersion {
    pub fn from_magic(byte: u8) -> Option<Self> {
        match byte {
            MAGIC_V1 => Some(WireVersion::V1),
            MAGIC_V2 => Some(WireVersion::V2),
            _ => None,
        }
    }

    pub fn magic(self) -> u8 {
        match self {
            WireVersion::V1 => MAGIC_V1,
            WireVersion::V2 => MAGIC_V2,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            WireVersion::V1 => HEADER_LEN_V1,
            WireVersion::V2 => HEADER_LEN_V2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WireVersion::V1 => "v1",
            WireVersion::V2 => "v2",
        }
    }
}

pub(crate) fn is_magic(byte: u8) -> bool {
    byte == MAGIC_V1 || byte == MAGIC_V2
}

/// A parsed frame header, either version.
///
/// MAVLink 1 headers carry no flags; they read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: WireVersion,
    pub payload_len: u8,
    pub incompat_flags: u8,
    pub compat_flags: u8,
    pub seq: u8,
    pub sysid: u8,
    pub compid: u8,
    pub msgid: u32,
}

impl Header {
    /// Parse a header from the start of `buf`.
    ///
    /// Returns `None` when `buf` does not start with a magic byte or is
    /// shorter than that version's header.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let version = WireVersion::from_magic(*buf.first()?)?;
        if buf.len() < version.header_len() {
            return None;
        }

        let header = match version {
            WireVersion::V1 => Header {
                version,
                payload_len: buf[1],
                incompat_flags: 0,
                compat_flags: 0,
                seq: buf[2],
                sysid: buf[3],
                compid: buf[4],
                msgid: u32::from(buf[5]),
            },
            WireVersion::V2 => Header {
                version,
                payload_len: buf[1],
                incompat_flags: buf[2],
                compat_flags: buf[3],
                seq: buf[4],
                sysid: buf[5],
                compid: buf[6],
                msgid: u32::from_le_bytes([buf[7], buf[8], buf[9], 0]),
            },
        };
        Some(header)
    }

    pub fn is_signed(&self) -> bool {
        self.version == WireVersion::V2 && self.incompat_flags & IFLAG_SIGNED != 0
    }

    /// Total bytes this frame occupies on the wire.
    pub fn frame_len(&self) -> usize {
        let signature = if self.is_signed() { SIGNATURE_LEN } else { 0 };
        self.version.header_len() + usize::from(self.payload_len) + CHECKSUM_LEN + signature
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version.magic());
        dst.put_u8(self.payload_len);
        match self.version {
            WireVersion::V1 => {
                dst.put_u8(self.seq);
                dst.put_u8(self.sysid);
                dst.put_u8(self.compid);
                dst.put_u8(self.msgid as u8);
            }
            WireVersion::V2 => {
                dst.put_u8(self.incompat_flags);
                dst.put_u8(self.compat_flags);
                dst.put_u8(self.seq);
                dst.put_u8(self.sysid);
                dst.put_u8(self.compid);
                dst.put_slice(&self.msgid.to_le_bytes()[..3]);
            }
        }
    }
}

/// Outcome of checksum verification for an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcStatus {
    /// The checksum matched.
    Verified,
    /// The checksum did not match, but checking is disabled for this stream.
    Ignored,
    /// The message id is unknown, so there was no seed to check with.
    Unverified,
}

/// A decoded MAVLink message.
///
/// `payload` is always the full schema length when the message id is known:
/// trailing zeros trimmed by the sender are restored on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: WireVersion,
    pub compat_flags: u8,
    pub seq: u8,
    pub sysid: u8,
    pub compid: u8,
    pub msgid: u32,
    pub payload: Bytes,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
    pub crc: CrcStatus,
}

impl Message {
    /// Create an unsigned message with sequence number zero.
    pub fn new(
        version: WireVersion,
        sysid: u8,
        compid: u8,
        msgid: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            version,
            compat_flags: 0,
            seq: 0,
            sysid,
            compid,
            msgid,
            payload: payload.into(),
            signature: None,
            crc: CrcStatus::Verified,
        }
    }

    pub fn with_seq(mut self, seq: u8) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_signature(mut self, signature: [u8; SIGNATURE_LEN]) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// A frame accepted off the wire: the decoded message plus the exact bytes
/// it arrived as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub message: Message,
    pub raw: Bytes,
}

/// Result of one detection attempt at the front of a receive buffer.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes for the next frame yet.
    Incomplete,
    /// The candidate frame at the front was rejected; one byte was discarded.
    Invalid(FrameError),
    /// A complete frame was accepted and removed from the buffer.
    Valid {
        frame: DecodedFrame,
        consumed: usize,
    },
}

/// When outgoing MAVLink 2 payloads have trailing zeros removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrimPolicy {
    /// Always send the full payload.
    Never,
    /// Trim MAVLink 2 payloads; MAVLink 1 cannot be trimmed.
    #[default]
    V2Only,
}

/// Per-stream codec policy.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Reject frames whose checksum does not match. When false, mismatches
    /// are still reported through [`CrcStatus::Ignored`].
    pub check_crc: bool,
    /// Pass through frames whose message id has no definition.
    pub accept_unknown: bool,
    /// Trimming applied by [`serialize`].
    pub trim: TrimPolicy,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            check_crc: true,
            accept_unknown: true,
            trim: TrimPolicy::V2Only,
        }
    }
}

/// What a buffer starting with a magic byte holds.
pub(crate) enum Inspection {
    NeedMore,
    Reject(FrameError),
    Accept {
        header: Header,
        crc: CrcStatus,
        full_len: Option<usize>,
    },
}

/// Classify the candidate frame at the start of `buf` without consuming it.
pub(crate) fn inspect(buf: &[u8], table: &dyn MessageTable, config: &CodecConfig) -> Inspection {
    let Some(header) = Header::parse(buf) else {
        return Inspection::NeedMore;
    };

    if header.version == WireVersion::V2 && header.incompat_flags & !IFLAG_SIGNED != 0 {
        return Inspection::Reject(FrameError::UnsupportedIncompatFlags(
            header.incompat_flags,
        ));
    }

    if buf.len() < header.frame_len() {
        return Inspection::NeedMore;
    }

    let payload_end = header.version.header_len() + usize::from(header.payload_len);
    let Some(info) = table.lookup(header.msgid) else {
        if config.accept_unknown {
            return Inspection::Accept {
                header,
                crc: CrcStatus::Unverified,
                full_len: None,
            };
        }
        return Inspection::Reject(FrameError::UnknownMessage(header.msgid));
    };

    let expected = frame_checksum(&buf[1..payload_end], info.crc_extra);
    let actual = u16::from_le_bytes([buf[payload_end], buf[payload_end + 1]]);
    let crc = if expected == actual {
        CrcStatus::Verified
    } else if config.check_crc {
        return Inspection::Reject(FrameError::ChecksumMismatch {
            msgid: header.msgid,
            expected,
            actual,
        });
    } else {
        CrcStatus::Ignored
    };

    Inspection::Accept {
        header,
        crc,
        full_len: Some(usize::from(info.max_len)),
    }
}

/// Detect, size and validate the next frame at the front of `src`.
///
/// Leading bytes that cannot start a frame are discarded. A rejected
/// candidate costs exactly its magic byte, so a real frame beginning
/// anywhere inside a corrupt one is still found on the next call.
pub fn detect_and_validate(
    src: &mut BytesMut,
    table: &dyn MessageTable,
    config: &CodecConfig,
) -> Decoded {
    match src.iter().position(|&b| is_magic(b)) {
        Some(0) => {}
        Some(skip) => {
            trace!(skip, "discarding bytes before start of frame");
            src.advance(skip);
        }
        None => {
            if !src.is_empty() {
                trace!(skip = src.len(), "no start of frame in buffer");
                src.clear();
            }
            return Decoded::Incomplete;
        }
    }

    match inspect(src, table, config) {
        Inspection::NeedMore => Decoded::Incomplete,
        Inspection::Reject(err) => {
            src.advance(1);
            Decoded::Invalid(err)
        }
        Inspection::Accept {
            header,
            crc,
            full_len,
        } => {
            let consumed = header.frame_len();
            let raw = src.split_to(consumed).freeze();
            let header_len = header.version.header_len();
            let wire_payload = &raw[header_len..header_len + usize::from(header.payload_len)];
            let payload = untrim(wire_payload, full_len.unwrap_or(0));

            let signature = header.is_signed().then(|| {
                let mut sig = [0u8; SIGNATURE_LEN];
                sig.copy_from_slice(&raw[consumed - SIGNATURE_LEN..]);
                sig
            });

            let message = Message {
                version: header.version,
                compat_flags: header.compat_flags,
                seq: header.seq,
                sysid: header.sysid,
                compid: header.compid,
                msgid: header.msgid,
                payload,
                signature,
                crc,
            };

            Decoded::Valid {
                frame: DecodedFrame { message, raw },
                consumed,
            }
        }
    }
}

/// Restore trailing zeros a sender trimmed from a payload.
///
/// Zero-extends `raw_payload` to `full_len`; payloads already at or beyond
/// `full_len` are returned unchanged.
pub fn untrim(raw_payload: &[u8], full_len: usize) -> Bytes {
    if raw_payload.len() >= full_len {
        return Bytes::copy_from_slice(raw_payload);
    }
    let mut payload = BytesMut::with_capacity(full_len);
    payload.extend_from_slice(raw_payload);
    payload.resize(full_len, 0);
    payload.freeze()
}

/// [`untrim`] using the full length the table declares for `msgid`.
///
/// Unknown ids are returned unchanged.
pub fn untrim_for(raw_payload: &[u8], msgid: u32, table: &dyn MessageTable) -> Bytes {
    let full_len = table.lookup(msgid).map_or(0, |info| usize::from(info.max_len));
    untrim(raw_payload, full_len)
}

/// Length of `payload` without trailing zeros, keeping at least one byte.
pub fn trimmed_len(payload: &[u8]) -> usize {
    let mut len = payload.len();
    while len > 1 && payload[len - 1] == 0 {
        len -= 1;
    }
    len
}

/// Encode `message` into wire format, appending to `dst`.
///
/// Returns the number of bytes written. The checksum is recomputed over
/// the bytes actually emitted, after any trimming.
pub fn serialize(
    message: &Message,
    table: &dyn MessageTable,
    trim: TrimPolicy,
    dst: &mut BytesMut,
) -> Result<usize> {
    let info = table
        .lookup(message.msgid)
        .ok_or(FrameError::UnknownMessage(message.msgid))?;

    if message.version == WireVersion::V1 && message.msgid > u32::from(u8::MAX) {
        return Err(FrameError::MessageIdOutOfRange {
            msgid: message.msgid,
            version: message.version.as_str(),
        });
    }

    let payload: &[u8] = &message.payload;
    let payload = match (message.version, trim) {
        (WireVersion::V2, TrimPolicy::V2Only) => &payload[..trimmed_len(payload)],
        _ => payload,
    };
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let signature = match message.version {
        WireVersion::V2 => message.signature.as_ref(),
        WireVersion::V1 => None,
    };

    let header = Header {
        version: message.version,
        payload_len: payload.len() as u8,
        incompat_flags: if signature.is_some() { IFLAG_SIGNED } else { 0 },
        compat_flags: message.compat_flags,
        seq: message.seq,
        sysid: message.sysid,
        compid: message.compid,
        msgid: message.msgid,
    };

    let start = dst.len();
    dst.reserve(header.frame_len());
    header.put(dst);
    dst.put_slice(payload);
    let crc = frame_checksum(&dst[start + 1..], info.crc_extra);
    dst.put_u16_le(crc);
    if let Some(sig) = signature {
        dst.put_slice(sig);
    }

    Ok(dst.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageInfo, MessageRegistry};

    const HEARTBEAT: u32 = 0;
    const COMMAND_LONG: u32 = 76;

    fn registry() -> MessageRegistry {
        MessageRegistry::common()
    }

    fn heartbeat(version: WireVersion) -> Message {
        // custom_mode=0, type=2 (quadrotor), autopilot=3, base_mode=0x51, status=4, version=3
        Message::new(
            version,
            1,
            1,
            HEARTBEAT,
            vec![0, 0, 0, 0, 2, 3, 0x51, 4, 3],
        )
        .with_seq(7)
    }

    fn command_long(version: WireVersion) -> Message {
        let payload: Vec<u8> = (1..=33).collect();
        Message::new(version, 255, 190, COMMAND_LONG, payload).with_seq(42)
    }

    fn encode(message: &Message, trim: TrimPolicy) -> BytesMut {
        let mut buf = BytesMut::new();
        serialize(message, &registry(), trim, &mut buf).unwrap();
        buf
    }

    fn expect_valid(buf: &mut BytesMut, config: &CodecConfig) -> (DecodedFrame, usize) {
        match detect_and_validate(buf, &registry(), config) {
            Decoded::Valid { frame, consumed } => (frame, consumed),
            other => panic!("expected valid frame, got {other:?}"),
        }
    }

    #[test]
    fn test_v1_roundtrip() {
        let message = heartbeat(WireVersion::V1);
        let mut buf = encode(&message, TrimPolicy::V2Only);
        assert_eq!(buf.len(), HEADER_LEN_V1 + 9 + CHECKSUM_LEN);
        assert_eq!(buf[0], MAGIC_V1);
        let wire_len = buf.len();

        let (frame, consumed) = expect_valid(&mut buf, &CodecConfig::default());
        assert_eq!(consumed, wire_len);
        assert_eq!(frame.message, message);
        assert_eq!(frame.raw.len(), wire_len);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_v2_roundtrip_restores_trimmed_zeros() {
        let mut payload = vec![0u8; 33];
        payload[0] = 9;
        payload[4] = 1;
        let message = Message::new(WireVersion::V2, 1, 1, COMMAND_LONG, payload).with_seq(3);

        let mut buf = encode(&message, TrimPolicy::V2Only);
        // Only the first five payload bytes survive trimming.
        assert_eq!(buf[1], 5);
        assert_eq!(buf.len(), HEADER_LEN_V2 + 5 + CHECKSUM_LEN);
        let wire_len = buf.len();

        let (frame, consumed) = expect_valid(&mut buf, &CodecConfig::default());
        assert_eq!(consumed, wire_len);
        assert_eq!(frame.message, message);
        assert_eq!(frame.message.payload.len(), 33);
    }

    #[test]
    fn test_v2_untrimmed_policy_sends_full_payload() {
        let message = heartbeat(WireVersion::V2);
        let buf = encode(&message, TrimPolicy::Never);
        assert_eq!(buf[1], 9);
        let trimmed = encode(&message, TrimPolicy::V2Only);
        assert_eq!(trimmed[1], 9, "heartbeat ends in a non-zero byte");
    }

    #[test]
    fn test_all_zero_payload_keeps_one_byte() {
        let message = Message::new(WireVersion::V2, 1, 1, HEARTBEAT, vec![0u8; 9]);
        let mut buf = encode(&message, TrimPolicy::V2Only);
        assert_eq!(buf[1], 1);
        let (frame, _) = expect_valid(&mut buf, &CodecConfig::default());
        assert_eq!(frame.message.payload.as_ref(), &[0u8; 9]);
    }

    #[test]
    fn test_v2_msgid_spans_three_bytes() {
        let mut table = registry();
        table.insert(MessageInfo::new(0x01_2345, 77, 2, 2)).unwrap();
        let message = Message::new(WireVersion::V2, 1, 1, 0x01_2345, vec![1, 2]);
        let mut buf = BytesMut::new();
        serialize(&message, &table, TrimPolicy::Never, &mut buf).unwrap();
        assert_eq!(&buf[7..10], &[0x45, 0x23, 0x01]);

        match detect_and_validate(&mut buf, &table, &CodecConfig::default()) {
            Decoded::Valid { frame, .. } => assert_eq!(frame.message.msgid, 0x01_2345),
            other => panic!("expected valid frame, got {other:?}"),
        }
    }

    #[test]
    fn test_signed_frame_keeps_signature() {
        let signature = [0xA5; SIGNATURE_LEN];
        let message = command_long(WireVersion::V2).with_signature(signature);
        let mut buf = encode(&message, TrimPolicy::V2Only);
        assert_eq!(buf[2] & IFLAG_SIGNED, IFLAG_SIGNED);
        assert_eq!(buf.len(), HEADER_LEN_V2 + 33 + CHECKSUM_LEN + SIGNATURE_LEN);

        let (frame, consumed) = expect_valid(&mut buf, &CodecConfig::default());
        assert_eq!(consumed, HEADER_LEN_V2 + 33 + CHECKSUM_LEN + SIGNATURE_LEN);
        assert_eq!(frame.message.signature, Some(signature));
        assert_eq!(frame.message, message);
    }

    #[test]
    fn test_v1_drops_signature() {
        let message = heartbeat(WireVersion::V1).with_signature([1; SIGNATURE_LEN]);
        let buf = encode(&message, TrimPolicy::Never);
        assert_eq!(buf.len(), HEADER_LEN_V1 + 9 + CHECKSUM_LEN);
    }

    #[test]
    fn test_incomplete_header_is_kept() {
        let full = encode(&command_long(WireVersion::V2), TrimPolicy::Never);
        let mut buf = BytesMut::from(&full[..HEADER_LEN_V2 - 1]);
        assert!(matches!(
            detect_and_validate(&mut buf, &registry(), &CodecConfig::default()),
            Decoded::Incomplete
        ));
        assert_eq!(buf.len(), HEADER_LEN_V2 - 1);
    }

    #[test]
    fn test_incomplete_payload_is_kept() {
        let full = encode(&command_long(WireVersion::V2), TrimPolicy::Never);
        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(matches!(
            detect_and_validate(&mut buf, &registry(), &CodecConfig::default()),
            Decoded::Incomplete
        ));
        assert_eq!(buf.len(), full.len() - 1);
    }

    #[test]
    fn test_leading_garbage_discarded() {
        let mut buf = BytesMut::from(&[0x00, 0x11, 0x22][..]);
        assert!(matches!(
            detect_and_validate(&mut buf, &registry(), &CodecConfig::default()),
            Decoded::Incomplete
        ));
        assert!(buf.is_empty());

        let frame = encode(&heartbeat(WireVersion::V2), TrimPolicy::V2Only);
        let mut buf = BytesMut::from(&b"junk"[..]);
        buf.extend_from_slice(&frame);
        let (decoded, consumed) = expect_valid(&mut buf, &CodecConfig::default());
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.raw.as_ref(), frame.as_ref());
    }

    #[test]
    fn test_checksum_mismatch_discards_only_magic() {
        let mut buf = encode(&command_long(WireVersion::V1), TrimPolicy::Never);
        let len = buf.len();
        buf[len - 1] ^= 0xFF;

        match detect_and_validate(&mut buf, &registry(), &CodecConfig::default()) {
            Decoded::Invalid(FrameError::ChecksumMismatch { msgid, .. }) => {
                assert_eq!(msgid, COMMAND_LONG)
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        assert_eq!(buf.len(), len - 1);
    }

    #[test]
    fn test_checksum_mismatch_tolerated_when_checking_disabled() {
        let mut buf = encode(&command_long(WireVersion::V2), TrimPolicy::Never);
        let len = buf.len();
        buf[len - 2] ^= 0x01;

        let config = CodecConfig {
            check_crc: false,
            ..CodecConfig::default()
        };
        let (frame, consumed) = expect_valid(&mut buf, &config);
        assert_eq!(consumed, len);
        assert_eq!(frame.message.crc, CrcStatus::Ignored);
    }

    #[test]
    fn test_single_bit_flips_are_detected() {
        for version in [WireVersion::V1, WireVersion::V2] {
            let frame = encode(&command_long(version), TrimPolicy::Never);
            let header_len = version.header_len();
            let payload_end = header_len + 33;
            // Length and flag bytes change the frame's extent rather than its
            // content; the message id is covered separately below.
            let fixed: Vec<usize> = match version {
                WireVersion::V1 => vec![2, 3, 4],
                WireVersion::V2 => vec![3, 4, 5, 6],
            };
            let positions = fixed.into_iter().chain(header_len..payload_end + 2);

            for pos in positions {
                for bit in 0..8 {
                    let mut buf = frame.clone();
                    buf[pos] ^= 1 << bit;
                    match detect_and_validate(&mut buf, &registry(), &CodecConfig::default()) {
                        Decoded::Invalid(FrameError::ChecksumMismatch { .. }) => {}
                        other => panic!(
                            "{} flip at byte {pos} bit {bit} not detected: {other:?}",
                            version.as_str()
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn test_msgid_bit_flips_rejected_in_strict_mode() {
        let strict = CodecConfig {
            accept_unknown: false,
            ..CodecConfig::default()
        };
        for version in [WireVersion::V1, WireVersion::V2] {
            let frame = encode(&command_long(version), TrimPolicy::Never);
            let msgid_bytes = match version {
                WireVersion::V1 => 5..6,
                WireVersion::V2 => 7..10,
            };
            for pos in msgid_bytes {
                for bit in 0..8 {
                    let mut buf = frame.clone();
                    buf[pos] ^= 1 << bit;
                    match detect_and_validate(&mut buf, &registry(), &strict) {
                        Decoded::Invalid(err) => assert!(err.is_recoverable()),
                        other => panic!("msgid flip at byte {pos} bit {bit}: {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_unknown_message_passes_unverified_by_default() {
        let mut table = registry();
        table.insert(MessageInfo::new(50_000, 12, 3, 3)).unwrap();
        let message = Message::new(WireVersion::V2, 1, 1, 50_000, vec![1, 2, 3]);
        let mut buf = BytesMut::new();
        serialize(&message, &table, TrimPolicy::Never, &mut buf).unwrap();

        match detect_and_validate(&mut buf.clone(), &registry(), &CodecConfig::default()) {
            Decoded::Valid { frame, .. } => {
                assert_eq!(frame.message.crc, CrcStatus::Unverified);
                assert_eq!(frame.message.payload.as_ref(), &[1, 2, 3]);
            }
            other => panic!("expected unverified frame, got {other:?}"),
        }

        let strict = CodecConfig {
            accept_unknown: false,
            ..CodecConfig::default()
        };
        assert!(matches!(
            detect_and_validate(&mut buf, &registry(), &strict),
            Decoded::Invalid(FrameError::UnknownMessage(50_000))
        ));
    }

    #[test]
    fn test_unsupported_incompat_flags_rejected() {
        let mut buf = encode(&heartbeat(WireVersion::V2), TrimPolicy::Never);
        buf[2] = 0x02;
        let len = buf.len();
        assert!(matches!(
            detect_and_validate(&mut buf, &registry(), &CodecConfig::default()),
            Decoded::Invalid(FrameError::UnsupportedIncompatFlags(0x02))
        ));
        assert_eq!(buf.len(), len - 1);
    }

    #[test]
    fn test_untrim_is_idempotent() {
        let cases: [(&[u8], usize); 4] = [
            (&[1, 2, 3], 9),
            (&[], 4),
            (&[5; 9], 9),
            (&[7; 12], 9),
        ];
        for (raw, full) in cases {
            let once = untrim(raw, full);
            let twice = untrim(&once, full);
            assert_eq!(once, twice);
            assert_eq!(once.len(), raw.len().max(full));
            assert_eq!(&once[..raw.len()], raw);
        }
    }

    #[test]
    fn test_untrim_for_uses_table_length() {
        let table = registry();
        assert_eq!(untrim_for(&[1], HEARTBEAT, &table).len(), 9);
        assert_eq!(untrim_for(&[1], 60_000, &table).len(), 1);
    }

    #[test]
    fn test_serialize_rejects_bad_messages() {
        let table = registry();
        let mut buf = BytesMut::new();

        let unknown = Message::new(WireVersion::V2, 1, 1, 60_000, vec![1]);
        assert!(matches!(
            serialize(&unknown, &table, TrimPolicy::Never, &mut buf),
            Err(FrameError::UnknownMessage(60_000))
        ));

        let mut wide = registry();
        wide.insert(MessageInfo::new(300, 1, 1, 1)).unwrap();
        let v1_wide = Message::new(WireVersion::V1, 1, 1, 300, vec![1]);
        assert!(matches!(
            serialize(&v1_wide, &wide, TrimPolicy::Never, &mut buf),
            Err(FrameError::MessageIdOutOfRange { msgid: 300, .. })
        ));

        let huge = Message::new(WireVersion::V1, 1, 1, HEARTBEAT, vec![1u8; 300]);
        assert!(matches!(
            serialize(&huge, &table, TrimPolicy::Never, &mut buf),
            Err(FrameError::PayloadTooLarge { size: 300, .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = encode(&heartbeat(WireVersion::V1), TrimPolicy::V2Only);
        buf.extend_from_slice(&encode(&command_long(WireVersion::V2), TrimPolicy::V2Only));

        let (first, _) = expect_valid(&mut buf, &CodecConfig::default());
        let (second, _) = expect_valid(&mut buf, &CodecConfig::default());
        assert_eq!(first.message.msgid, HEARTBEAT);
        assert_eq!(second.message.msgid, COMMAND_LONG);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_frame_len() {
        assert_eq!(MAX_FRAME_LEN, 280);
    }
}
