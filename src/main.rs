#![warn(clippy::all)]

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use tunnel_proxy::config::{
    DEFAULT_PROXY_PORT, DEFAULT_TUN_ADDRESS, DEFAULT_TUN_DNS, DEFAULT_TUN_MTU, DEFAULT_TUN_NAME,
    DEFAULT_TUN_PREFIX,
};
use tunnel_proxy::{
    format_bytes, InterfaceConfig, ProxyConfig, ReconnectConfig, Route, Service, ServiceConfig,
    ServiceError, ServiceEvent,
};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_connect: u64,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_idle: u64,

    #[arg(long, default_value = DEFAULT_TUN_NAME)]
    tun_name: String,

    #[arg(long, default_value_t = DEFAULT_TUN_ADDRESS)]
    tun_address: Ipv4Addr,

    #[arg(long, default_value_t = DEFAULT_TUN_PREFIX)]
    tun_prefix: u8,

    #[arg(long, default_value_t = DEFAULT_TUN_DNS)]
    tun_dns: Ipv4Addr,

    #[arg(long, default_value_t = DEFAULT_TUN_MTU)]
    mtu: u16,

    /// Route all traffic through the tunnel interface (Linux, needs root)
    #[arg(long)]
    install_route: bool,

    #[arg(long, default_value_t = 5)]
    reconnect_delay: u64,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            proxy: ProxyConfig {
                listen: SocketAddr::new(self.host, self.port),
                connect_timeout: Duration::from_secs(self.timeout_connect),
                idle_timeout: Duration::from_secs(self.timeout_idle),
            },
            interface: InterfaceConfig {
                name: self.tun_name.clone(),
                address: self.tun_address,
                prefix_len: self.tun_prefix,
                route: Route::DEFAULT,
                dns: self.tun_dns,
                mtu: self.mtu,
                install_route: self.install_route,
            },
            reconnect: ReconnectConfig {
                delay: Duration::from_secs(self.reconnect_delay),
            },
        }
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let service = Service::new(args.service_config());

    spawn_event_logger(&service);

    match service.start().await {
        Ok(()) => {}
        Err(ServiceError::Bind { source, .. }) if source.kind() == ErrorKind::AddrInUse => {
            eprintln!("\n❌ PORT {} ALREADY IN USE\n", args.port);
            eprintln!("   Find the owner: lsof -i:{} -P -n | grep LISTEN", args.port);
            eprintln!("\n   Or just run with different port: --port {}\n", args.port.wrapping_add(1));
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Start failed: {}", e);
            std::process::exit(1);
        }
    }

    if args.stats_interval > 0 {
        let service = service.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            // first tick fires immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                service.stats().print();
                let packets = service.packet_stats();
                info!(
                    "📦 packets tcp={} udp={} other={} ipv6={} dropped={}",
                    packets.tcp, packets.udp, packets.other, packets.ipv6, packets.dropped
                );
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.stop().await;

    Ok(())
}

fn spawn_event_logger(service: &Service) {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::Traffic(totals)) => debug!(
                    "Traffic in={} out={}",
                    format_bytes(totals.bytes_in),
                    format_bytes(totals.bytes_out)
                ),
                Ok(ServiceEvent::InterfaceLost) => warn!("Tunnel interface lost, reconnecting"),
                Ok(event) => debug!("Service event: {:?}", event),
                Err(RecvError::Lagged(missed)) => debug!("Event logger missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
