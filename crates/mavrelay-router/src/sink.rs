use std::io::Write;

use mavrelay_frame::{DecodedFrame, TlogWriter};
use tracing::warn;

/// Durable recorder of routed frames.
///
/// Sinks own their failures: nothing they do can stop the loop.
pub trait LogSink {
    fn record(&mut self, timestamp_us: u64, frame: &DecodedFrame);

    fn flush(&mut self) {}
}

impl<W: Write> LogSink for TlogWriter<W> {
    fn record(&mut self, timestamp_us: u64, frame: &DecodedFrame) {
        if let Err(err) = self.write_record(timestamp_us, &frame.raw) {
            warn!(error = %err, "failed to write tlog record");
        }
    }

    fn flush(&mut self) {
        if let Err(err) = TlogWriter::flush(self) {
            warn!(error = %err, "failed to flush tlog");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use mavrelay_frame::{
        detect_and_validate, serialize, CodecConfig, Decoded, Message, MessageRegistry,
        TlogReader, TrimPolicy, WireVersion,
    };

    use super::*;

    fn decoded(seq: u8) -> DecodedFrame {
        let table = MessageRegistry::common();
        let message = Message::new(WireVersion::V2, 1, 1, 0, vec![1; 9]).with_seq(seq);
        let mut buf = BytesMut::new();
        serialize(&message, &table, TrimPolicy::V2Only, &mut buf).unwrap();
        match detect_and_validate(&mut buf, &table, &CodecConfig::default()) {
            Decoded::Valid { frame, .. } => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn tlog_sink_records_raw_frames() {
        let mut sink = TlogWriter::new(Vec::new());
        {
            let sink: &mut dyn LogSink = &mut sink;
            sink.record(100, &decoded(1));
            sink.record(200, &decoded(2));
            sink.flush();
        }

        let records: Vec<_> = TlogReader::new(std::io::Cursor::new(sink.into_inner()))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].timestamp_us, 200);
        assert_eq!(records[1].frame.message.seq, 2);
    }

    #[test]
    fn write_failures_are_swallowed() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk full"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut sink = TlogWriter::new(Full);
        LogSink::record(&mut sink, 1, &decoded(1));
        assert_eq!(sink.records(), 0);
    }
}
