use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{serialize, CodecConfig, DecodedFrame, Message};
use crate::deframer::{DeframeStats, Deframer};
use crate::error::FrameError;
use crate::message::{MessageRegistry, MessageTable};

/// MAVLink framing for `tokio_util::codec::Framed` streams.
///
/// Decoding goes through the same [`Deframer`] the router uses, so corrupt
/// frames are skipped rather than surfaced as stream errors.
pub struct MavCodec {
    table: Arc<dyn MessageTable>,
    deframer: Deframer,
}

impl MavCodec {
    pub fn new(table: Arc<dyn MessageTable>, config: CodecConfig) -> Self {
        Self {
            table,
            deframer: Deframer::new(config),
        }
    }

    pub fn stats(&self) -> &DeframeStats {
        self.deframer.stats()
    }
}

impl Default for MavCodec {
    fn default() -> Self {
        Self::new(Arc::new(MessageRegistry::common()), CodecConfig::default())
    }
}

impl Decoder for MavCodec {
    type Item = DecodedFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.deframer.next_frame(src, self.table.as_ref()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for MavCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let trim = self.deframer.config().trim;
        serialize(&item, self.table.as_ref(), trim, dst)?;
        Ok(())
    }
}
