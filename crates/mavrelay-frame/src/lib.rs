//! MAVLink frame detection, validation and serialization.
//!
//! Two wire versions share one stateless codec:
//! - v1: magic `0xFE`, 6-byte header, 8-bit message id
//! - v2: magic `0xFD`, 10-byte header, 24-bit message id, optional 13-byte
//!   signature, trailing-zero payload trimming
//!
//! Every frame ends in an X.25 checksum seeded with a per-message byte from
//! the [`MessageTable`]. A corrupt candidate costs a single byte, so a good
//! frame hiding inside a bad one is never lost.

pub mod codec;
pub mod crc;
pub mod deframer;
pub mod error;
pub mod message;
pub mod reader;
pub mod tlog;

#[cfg(feature = "async")]
pub mod async_codec;

pub use codec::{
    detect_and_validate, serialize, trimmed_len, untrim, untrim_for, CodecConfig, CrcStatus,
    Decoded, DecodedFrame, Header, Message, TrimPolicy, WireVersion, MAGIC_V1, MAGIC_V2,
    MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};
pub use deframer::{DeframeStats, Deframer};
pub use error::{FrameError, Result};
pub use message::{MessageInfo, MessageRegistry, MessageTable, COMMON_MESSAGES};
pub use reader::FrameReader;
pub use tlog::{timestamp_now, TlogReader, TlogRecord, TlogWriter};

#[cfg(feature = "async")]
pub use async_codec::MavCodec;
