use std::fmt::Write as _;
use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mavrelay_frame::{CrcStatus, DecodedFrame, WireVersion};
use mavrelay_router::EndpointReport;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FrameRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_us: Option<u64>,
    pub version: WireVersion,
    pub seq: u8,
    pub sysid: u8,
    pub compid: u8,
    pub msgid: u32,
    pub payload_len: usize,
    pub crc: CrcStatus,
    pub signed: bool,
    pub payload: String,
}

impl FrameRow {
    pub fn new(frame: &DecodedFrame, timestamp_us: Option<u64>) -> Self {
        let message = &frame.message;
        Self {
            timestamp_us,
            version: message.version,
            seq: message.seq,
            sysid: message.sysid,
            compid: message.compid,
            msgid: message.msgid,
            payload_len: message.payload.len(),
            crc: message.crc,
            signed: message.signature.is_some(),
            payload: hex(&message.payload),
        }
    }
}

/// Prints decoded frames as they are read. Table output is collected and
/// rendered once at the end.
pub struct FramePrinter {
    format: OutputFormat,
    table: Option<Table>,
}

impl FramePrinter {
    pub fn new(format: OutputFormat) -> Self {
        let table = (format == OutputFormat::Table).then(|| {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "TIME (us)", "VER", "SEQ", "SYS", "COMP", "MSGID", "LEN", "CRC", "SIGNED",
                ]);
            table
        });
        Self { format, table }
    }

    pub fn print(&mut self, frame: &DecodedFrame, timestamp_us: Option<u64>) {
        if self.format == OutputFormat::Raw {
            print_raw(&frame.raw);
            return;
        }

        let row = FrameRow::new(frame, timestamp_us);
        match (self.format, self.table.as_mut()) {
            (OutputFormat::Table, Some(table)) => {
                table.add_row(vec![
                    row.timestamp_us.map(|t| t.to_string()).unwrap_or_default(),
                    row.version.as_str().to_string(),
                    row.seq.to_string(),
                    row.sysid.to_string(),
                    row.compid.to_string(),
                    row.msgid.to_string(),
                    row.payload_len.to_string(),
                    crc_label(row.crc).to_string(),
                    row.signed.to_string(),
                ]);
            }
            (OutputFormat::Pretty, _) => {
                let time = row
                    .timestamp_us
                    .map(|t| format!("t={t} "))
                    .unwrap_or_default();
                println!(
                    "{time}{} seq={} sys={} comp={} msgid={} len={} crc={}{} payload={}",
                    row.version.as_str(),
                    row.seq,
                    row.sysid,
                    row.compid,
                    row.msgid,
                    row.payload_len,
                    crc_label(row.crc),
                    if row.signed { " signed" } else { "" },
                    row.payload
                );
            }
            _ => println!(
                "{}",
                serde_json::to_string(&row).unwrap_or_else(|_| "{}".to_string())
            ),
        }
    }

    pub fn finish(self) {
        if let Some(table) = self.table {
            println!("{table}");
        }
    }
}

pub fn print_stats(reports: &[EndpointReport], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(reports).unwrap_or_else(|_| "[]".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "ENDPOINT", "KIND", "PEER", "RX MSGS", "RX BYTES", "CRC ERR", "TX MSGS",
                    "TX BYTES", "DROPPED",
                ]);
            for report in reports {
                table.add_row(vec![
                    report.name.clone(),
                    report.kind.to_string(),
                    report.peer.clone().unwrap_or_else(|| "-".to_string()),
                    report.stats.read.messages.to_string(),
                    report.stats.read.bytes.to_string(),
                    report.stats.read.crc_errors.to_string(),
                    report.stats.write.messages.to_string(),
                    report.stats.write.bytes.to_string(),
                    report.stats.write.dropped.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for report in reports {
                let read = &report.stats.read;
                let write = &report.stats.write;
                println!(
                    "{} ({}): rx {} msgs / {} bytes, {} crc errors; tx {} msgs / {} bytes, {} dropped",
                    report.name,
                    report.kind,
                    read.messages,
                    read.bytes,
                    read.crc_errors,
                    write.messages,
                    write.bytes,
                    write.dropped
                );
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn crc_label(status: CrcStatus) -> &'static str {
    match status {
        CrcStatus::Verified => "ok",
        CrcStatus::Ignored => "bad",
        CrcStatus::Unverified => "unverified",
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex(&[0x00, 0x0f, 0xab]), "000fab");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn crc_labels() {
        assert_eq!(crc_label(CrcStatus::Ignored), "bad");
        assert_eq!(crc_label(CrcStatus::Unverified), "unverified");
    }
}
