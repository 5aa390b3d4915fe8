use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mavrelay_frame::{MessageTable, TlogWriter};
use mavrelay_router::{
    Core, EndpointConfig, LoopConfig, Mainloop, TimeoutAction, TimeoutControl,
};
use mavrelay_transport::{SerialTransport, TcpServer, TcpTransport, Transport, UdpTransport};
use tracing::info;

use crate::cmd::{load_table, RouteArgs};
use crate::config::{parse_duration, parse_uart, EndpointSpec, Link, RouteConfig};
use crate::exit::{
    frame_error, router_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS,
};
use crate::output::{print_stats, OutputFormat};

pub fn run(args: RouteArgs, format: OutputFormat) -> CliResult<i32> {
    let config = build_config(&args)?;
    let exit_after = args.exit_after.as_deref().map(parse_duration).transpose()?;
    let table: Arc<dyn MessageTable> = load_table(&config.dialects)?;

    let loop_config = LoopConfig {
        report_stats: config.report_stats.map(Duration::from_secs),
        ..LoopConfig::default()
    };
    let mut mainloop = Mainloop::new(table, loop_config)
        .map_err(|err| router_error("failed to start event loop", err))?;

    for spec in &config.endpoints {
        open_endpoint(&mut mainloop, spec, config.max_pending_tx)?;
    }

    if let Some(path) = &config.tlog {
        let writer = TlogWriter::create(path).map_err(|err| {
            frame_error(&format!("failed to create tlog {}", path.display()), err)
        })?;
        info!(path = %path.display(), "recording tlog");
        mainloop.set_sink(Box::new(writer));
    }

    if let Some(limit) = exit_after {
        mainloop
            .add_timeout(
                limit,
                Box::new(|core: &mut Core, _: &mut TimeoutControl| {
                    info!("run time limit reached");
                    core.request_shutdown();
                    TimeoutAction::Done
                }),
            )
            .map_err(|err| router_error("failed to schedule exit", err))?;
    }

    install_ctrlc_handler(mainloop.shutdown_handle())?;
    mainloop
        .run()
        .map_err(|err| router_error("event loop failed", err))?;

    print_stats(&mainloop.core().report(), format);
    Ok(SUCCESS)
}

/// Merge the config file (if any) with command-line endpoints and options.
fn build_config(args: &RouteArgs) -> CliResult<RouteConfig> {
    let mut config = match &args.config {
        Some(path) => RouteConfig::load(path)?,
        None => RouteConfig::default(),
    };

    for uart in &args.uart {
        let mut link = parse_uart(uart)?;
        if let Link::Uart { flow_control, .. } = &mut link {
            *flow_control = args.flow_control;
        }
        config.push_link(link);
    }
    for &address in &args.udp_server {
        config.push_link(Link::UdpServer { address });
    }
    for &address in &args.udp_client {
        config.push_link(Link::UdpClient { address });
    }
    for &address in &args.tcp_client {
        config.push_link(Link::TcpClient { address });
    }
    for &address in &args.tcp_listen {
        config.push_link(Link::TcpListen { address });
    }
    for name in &args.no_crc_check {
        config.disable_crc_check(name)?;
    }

    if args.tlog.is_some() {
        config.tlog = args.tlog.clone();
    }
    if args.report_stats.is_some() {
        config.report_stats = args.report_stats;
    }
    if args.max_pending_tx.is_some() {
        config.max_pending_tx = args.max_pending_tx;
    }
    config.dialects.extend(args.dialect.iter().cloned());

    config.validate()?;
    Ok(config)
}

fn open_endpoint(
    mainloop: &mut Mainloop,
    spec: &EndpointSpec,
    max_pending_tx: Option<usize>,
) -> CliResult<()> {
    let mut endpoint = EndpointConfig::new(spec.name.clone());
    endpoint.check_crc = spec.check_crc;
    if let Some(limit) = max_pending_tx {
        endpoint.max_pending_tx = limit;
    }

    let context = format!("endpoint {}", spec.name);
    let opened = |err| transport_error(&context, err);
    let transport: Box<dyn Transport> = match &spec.link {
        Link::Uart {
            device,
            baud,
            flow_control,
        } => Box::new(
            SerialTransport::open_with_flow_control(device, *baud, *flow_control)
                .map_err(opened)?,
        ),
        Link::UdpServer { address } => Box::new(UdpTransport::bind(*address).map_err(opened)?),
        Link::UdpClient { address } => {
            Box::new(UdpTransport::connect(*address).map_err(opened)?)
        }
        Link::TcpClient { address } => {
            Box::new(TcpTransport::connect(*address).map_err(opened)?)
        }
        Link::TcpListen { address } => {
            let server = TcpServer::bind(*address).map_err(opened)?;
            mainloop
                .add_listener(server, endpoint)
                .map_err(|err| router_error(&context, err))?;
            return Ok(());
        }
    };

    mainloop
        .add_endpoint(endpoint, transport)
        .map_err(|err| router_error(&context, err))?;
    Ok(())
}

fn install_ctrlc_handler(shutdown: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
