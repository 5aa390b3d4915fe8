use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Subcommand};
use mavrelay_frame::MessageRegistry;
use tracing::info;

use crate::exit::{frame_error, CliResult};
use crate::output::OutputFormat;

pub mod inspect;
pub mod route;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Route MAVLink traffic between endpoints until interrupted.
    Route(RouteArgs),
    /// Decode frames from a raw capture or tlog file.
    Inspect(InspectArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Route(args) => route::run(args, format),
        Command::Inspect(args) => inspect::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct RouteArgs {
    /// JSON file with endpoints and options; flags add to it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Serial device, optionally with a baud rate (default 115200).
    #[arg(long, value_name = "DEVICE[:BAUD]")]
    pub uart: Vec<String>,
    /// Enable RTS/CTS flow control on every --uart device.
    #[arg(long)]
    pub flow_control: bool,
    /// Listen for UDP on ADDR and reply to the last sender.
    #[arg(long, value_name = "ADDR")]
    pub udp_server: Vec<SocketAddr>,
    /// Send UDP to ADDR.
    #[arg(long, value_name = "ADDR")]
    pub udp_client: Vec<SocketAddr>,
    /// Connect to a TCP server at ADDR.
    #[arg(long, value_name = "ADDR")]
    pub tcp_client: Vec<SocketAddr>,
    /// Accept TCP clients on ADDR.
    #[arg(long, value_name = "ADDR")]
    pub tcp_listen: Vec<SocketAddr>,
    /// Forward frames with bad checksums from the named endpoint.
    #[arg(long, value_name = "NAME")]
    pub no_crc_check: Vec<String>,
    /// Record every routed frame to a tlog file.
    #[arg(long, value_name = "PATH")]
    pub tlog: Option<PathBuf>,
    /// Log endpoint statistics every SECS seconds.
    #[arg(long, value_name = "SECS")]
    pub report_stats: Option<u64>,
    /// Extra message definitions (JSON array of {id, crc_extra, min_len, max_len}).
    #[arg(long, value_name = "FILE")]
    pub dialect: Vec<PathBuf>,
    /// Per-endpoint limit on buffered outgoing bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_pending_tx: Option<usize>,
    /// Stop routing after this long (e.g. 30s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub exit_after: Option<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Capture file to decode.
    pub path: PathBuf,
    /// Read the file as a tlog (timestamped records) instead of a raw byte capture.
    #[arg(long)]
    pub tlog: bool,
    /// Stop after N frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Show frames with bad checksums instead of skipping them (raw captures).
    #[arg(long)]
    pub no_crc_check: bool,
    /// Extra message definitions.
    #[arg(long, value_name = "FILE")]
    pub dialect: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// The common message set plus any dialect files.
pub fn load_table(dialects: &[PathBuf]) -> CliResult<Arc<MessageRegistry>> {
    let mut registry = MessageRegistry::common();
    for path in dialects {
        let count = registry
            .load_dialect(path)
            .map_err(|err| frame_error(&dialect_context(path), err))?;
        info!(path = %path.display(), definitions = count, "loaded dialect");
    }
    Ok(Arc::new(registry))
}

fn dialect_context(path: &Path) -> String {
    format!("failed to load dialect {}", path.display())
}
