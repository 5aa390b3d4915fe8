use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::exit::{io_error, CliError, CliResult, DATA_INVALID};

pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Everything `route` needs, as read from `--config` and then extended by
/// command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteConfig {
    pub endpoints: Vec<EndpointSpec>,
    pub tlog: Option<PathBuf>,
    /// Seconds between statistics log lines.
    pub report_stats: Option<u64>,
    pub dialects: Vec<PathBuf>,
    pub max_pending_tx: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    #[serde(flatten)]
    pub link: Link,
    #[serde(default = "default_check_crc")]
    pub check_crc: bool,
}

fn default_check_crc() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Link {
    Uart {
        device: PathBuf,
        #[serde(default = "default_baudrate")]
        baud: u32,
        #[serde(default)]
        flow_control: bool,
    },
    UdpServer {
        address: SocketAddr,
    },
    UdpClient {
        address: SocketAddr,
    },
    TcpClient {
        address: SocketAddr,
    },
    TcpListen {
        address: SocketAddr,
    },
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

impl Link {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Link::Uart { .. } => "uart",
            Link::UdpServer { .. } => "udp-server",
            Link::UdpClient { .. } => "udp-client",
            Link::TcpClient { .. } => "tcp-client",
            Link::TcpListen { .. } => "tcp-listen",
        }
    }
}

impl RouteConfig {
    pub fn load(path: &Path) -> CliResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|err| io_error(&format!("failed to read {}", path.display()), err))?;
        serde_json::from_slice(&bytes).map_err(|err| {
            CliError::new(
                DATA_INVALID,
                format!("invalid config {}: {err}", path.display()),
            )
        })
    }

    /// Append an endpoint named after its link kind (`udp-server-1`, ...).
    pub fn push_link(&mut self, link: Link) {
        let kind = link.kind_name();
        let n = self
            .endpoints
            .iter()
            .filter(|spec| spec.link.kind_name() == kind)
            .count();
        self.endpoints.push(EndpointSpec {
            name: format!("{kind}-{}", n + 1),
            link,
            check_crc: true,
        });
    }

    pub fn disable_crc_check(&mut self, name: &str) -> CliResult<()> {
        let spec = self
            .endpoints
            .iter_mut()
            .find(|spec| spec.name == name)
            .ok_or_else(|| CliError::usage(format!("--no-crc-check: no endpoint named {name}")))?;
        spec.check_crc = false;
        Ok(())
    }

    pub fn validate(&self) -> CliResult<()> {
        if self.endpoints.is_empty() {
            return Err(CliError::usage("no endpoints configured"));
        }
        let mut names = HashSet::new();
        for spec in &self.endpoints {
            if !names.insert(spec.name.as_str()) {
                return Err(CliError::usage(format!(
                    "duplicate endpoint name {}",
                    spec.name
                )));
            }
        }
        if self.report_stats == Some(0) {
            return Err(CliError::usage("report interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Parse `DEVICE[:BAUD]`.
pub fn parse_uart(input: &str) -> CliResult<Link> {
    let (device, baud) = match input.rsplit_once(':') {
        Some((device, baud)) => {
            let baud = baud
                .parse()
                .map_err(|_| CliError::usage(format!("invalid baud rate in {input}")))?;
            (device, baud)
        }
        None => (input, DEFAULT_BAUDRATE),
    };
    if device.is_empty() {
        return Err(CliError::usage("uart device must not be empty"));
    }
    Ok(Link::Uart {
        device: PathBuf::from(device),
        baud,
        flow_control: false,
    })
}

/// Parse `500ms`, `5s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
