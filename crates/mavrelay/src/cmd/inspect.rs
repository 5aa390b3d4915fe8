use std::fs::File;
use std::sync::Arc;

use mavrelay_frame::{CodecConfig, FrameReader, MessageTable, TlogReader};
use tracing::info;

use crate::cmd::{load_table, InspectArgs};
use crate::exit::{frame_error, io_error, CliResult, SUCCESS};
use crate::output::{FramePrinter, OutputFormat};

pub fn run(args: InspectArgs, format: OutputFormat) -> CliResult<i32> {
    let table: Arc<dyn MessageTable> = load_table(&args.dialect)?;
    let file = File::open(&args.path)
        .map_err(|err| io_error(&format!("failed to open {}", args.path.display()), err))?;
    let limit = args.count.unwrap_or(usize::MAX);
    let mut printer = FramePrinter::new(format);
    let mut printed = 0usize;

    if args.tlog {
        let mut reader = TlogReader::with_table(file, table);
        for record in reader.by_ref().take(limit) {
            let record = record.map_err(|err| frame_error("failed to read tlog", err))?;
            printer.print(&record.frame, Some(record.timestamp_us));
            printed += 1;
        }
        info!(
            frames = printed,
            skipped_bytes = reader.skipped_bytes(),
            "tlog decoded"
        );
    } else {
        let config = CodecConfig {
            check_crc: !args.no_crc_check,
            ..CodecConfig::default()
        };
        let mut reader = FrameReader::with_config(file, table, config);
        for frame in reader.by_ref().take(limit) {
            let frame = frame.map_err(|err| frame_error("failed to read capture", err))?;
            printer.print(&frame, None);
            printed += 1;
        }
        let stats = reader.stats();
        info!(
            frames = printed,
            crc_errors = stats.crc_errors,
            unknown = stats.unknown,
            unsupported = stats.unsupported,
            "capture decoded"
        );
    }

    printer.finish();
    Ok(SUCCESS)
}
