mod config;
mod supervisor;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use dhcpeterd_dhcp::handler::{Handler, HandlerConfig, SystemClock};
use dhcpeterd_dhcp::lease::StaticLease;
use dhcpeterd_dhcp::persistence::{ChangeMessage, ChannelSink, PersistenceBridge};
use dhcpeterd_dhcp::server;
use rand::{rngs::StdRng, SeedableRng};
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use supervisor::spawn_supervised;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dhcpeterd", about = "DHCPv4 server daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "dhcpeterd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dhcpeterd=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

/// Builds every interface's `Handler`, starts its supervised serve loop,
/// and blocks until a shutdown signal arrives. Returns `Err` only for
/// startup-fatal conditions: bad config, unknown interface,
/// or a `start_ip` outside the interface's configured network.
async fn run(args: Args) -> anyhow::Result<()> {
    info!("dhcpeterd starting, config {}", args.config.display());

    let cfg = config::Config::load(&args.config).map_err(anyhow::Error::msg)?;

    let bridge = Arc::new(PersistenceBridge::new(cfg.lease_file.clone()));
    if !cfg.lease_file.is_empty() {
        bridge.load().map_err(anyhow::Error::from)?;
    }

    let (tx, rx) = mpsc::unbounded_channel::<ChangeMessage>();
    let persistence_task = tokio::spawn({
        let bridge = bridge.clone();
        async move { dhcpeterd_dhcp::persistence::run(bridge, rx).await }
    });

    for net in &cfg.networks {
        // Startup-fatal checks: an unknown interface or
        // an out-of-network start_ip stop the daemon outright rather than
        // looping forever inside a supervised retry.
        server::require_interface(&net.interface)?;
        let server_ip = server::resolve_server_ip(&net.interface)?;
        server::validate_start_ip(server_ip, net.start_ip, net.net_mask)?;

        let static_leases = net
            .static_leases
            .iter()
            .map(|s| StaticLease {
                addr: s.ip,
                hardware_addr: s.mac.to_lowercase(),
                hostname: s.name.clone(),
            })
            .collect();

        let handler_cfg = HandlerConfig {
            interface: net.interface.clone(),
            server_ip,
            start_ip: net.start_ip,
            netmask: net.net_mask,
            range: net.range,
            lease_period: net.lease_duration,
            dns_servers: net.dns_servers.clone(),
            static_leases,
        };

        let mut handler = Handler::new(
            handler_cfg,
            Arc::new(SystemClock),
            Box::new(StdRng::from_os_rng()),
            Some(Arc::new(ChannelSink::new(tx.clone()))),
        )?;
        handler.set_leases(bridge.leases_for(&net.interface));

        let handler = Arc::new(Mutex::new(handler));
        let iface_name = net.interface.clone();
        spawn_supervised("dhcp", move || {
            let handler = handler.clone();
            async move { server::run(handler, server_ip).await.map_err(anyhow::Error::from) }
        });
        info!(interface = %iface_name, "serve loop started");
    }
    drop(tx);

    wait_for_shutdown().await?;
    persistence_task.abort();
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGTERM])?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
        Some(sig) = signals.next() => info!("received signal {sig}, shutting down"),
    }
    Ok(())
}
