//! mvirt-tun daemon.
//!
//! Creates the TUN device, routes the remote subnets through it and tunnels
//! their traffic to the peer listening on localhost.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::IpNet;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_tun::Dispatcher;
use mvirt_tun::config::{DEFAULT_MTU, DispatcherConfig, TUN_NAME};
use mvirt_tun::device::TunDevice;

/// mvirt TUN router
#[derive(Parser, Debug)]
#[command(name = "mvirt-tun", version, about)]
struct Args {
    /// TUN device name
    #[arg(long, env = "MVIRT_TUN_NAME", default_value = TUN_NAME)]
    name: String,

    /// Device MTU
    #[arg(long, env = "MVIRT_TUN_MTU", default_value_t = DEFAULT_MTU)]
    mtu: usize,

    /// Port of the remote peer's tunnel service on 127.0.0.1
    #[arg(long, env = "MVIRT_TUN_PEER_PORT")]
    peer_port: u16,

    /// Timeout in seconds for connecting to the peer
    #[arg(long, env = "MVIRT_TUN_DIAL_TIMEOUT", default_value = "10")]
    dial_timeout: u64,

    /// Subnets routed through the device (repeatable, comma separated)
    #[arg(long = "subnet", env = "MVIRT_TUN_SUBNETS", value_delimiter = ',')]
    subnets: Vec<IpNet>,

    /// DNS server address whose queries are intercepted
    #[arg(long, env = "MVIRT_TUN_DNS_IP", requires = "dns_local_addr")]
    dns_ip: Option<IpAddr>,

    /// DNS server port
    #[arg(long, env = "MVIRT_TUN_DNS_PORT", default_value = "53")]
    dns_port: u16,

    /// Local resolver answering intercepted queries
    #[arg(long, env = "MVIRT_TUN_DNS_LOCAL_ADDR")]
    dns_local_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_tun=info,tonic=warn,tower=warn,h2=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!(name = %args.name, mtu = args.mtu, peer_port = args.peer_port, "Starting mvirt-tun");

    let device = TunDevice::create(&args.name, args.mtu)
        .with_context(|| format!("failed to create TUN device {}", args.name))?;

    let config = DispatcherConfig::new()
        .with_mtu(args.mtu)
        .with_dial_timeout(Duration::from_secs(args.dial_timeout));
    let dispatcher = Dispatcher::new(Arc::new(device), config);

    dispatcher
        .add_subnets(&args.subnets)
        .await
        .context("failed to add subnets")?;

    if let (Some(ip), Some(local_addr)) = (args.dns_ip, args.dns_local_addr) {
        dispatcher.configure_dns(ip, args.dns_port, local_addr);
    }

    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    };

    // Ends on a signal or as soon as a pipeline fails.
    let runner = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.serve(shutdown).await })
    };

    if let Err(e) = dispatcher.configure_session(args.peer_port).await {
        dispatcher.stop().await;
        return Err(e).context("failed to connect to remote peer");
    }

    match runner.await {
        Ok(res) => res.context("dispatcher failed")?,
        Err(e) => return Err(e).context("dispatcher task panicked"),
    }

    info!("mvirt-tun stopped");
    Ok(())
}
