use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info, warn};
use tun2ray_core::config::{parse_ip_list, split_list};
use tun2ray_core::device::TunDeviceFactory;
use tun2ray_core::{
    default_components, init_logging, DnsFallbackConfig, Engine, EngineConfig, LogLevel, TunConfig,
};

/// tun2ray - route a TUN interface through a proxy engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TUN interface name
    #[arg(long, default_value = "tun2ray")]
    tun_name: String,

    /// TUN interface address
    #[arg(long, default_value = "10.0.89.2")]
    tun_addr: Ipv4Addr,

    /// TUN interface gateway
    #[arg(long, default_value = "10.0.89.1")]
    tun_gw: Ipv4Addr,

    /// TUN interface netmask
    #[arg(long, default_value = "255.255.255.0")]
    tun_mask: Ipv4Addr,

    /// DNS resolvers for the TUN interface, separated by commas
    #[arg(long, default_value = "114.114.114.114")]
    tun_dns: String,

    /// Proxy engine config file (JSON)
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Traffic kinds to sniff for destination override, separated by commas
    #[arg(long, default_value = "http,tls")]
    sniffing_type: String,

    /// UDP session idle timeout in seconds
    #[arg(long, default_value_t = 60)]
    udp_timeout: u64,

    /// Do not proxy UDP; answer DNS queries over TCP instead
    #[arg(long)]
    dns_fallback: bool,

    /// Upstream for DNS fallback queries (defaults to the original destination)
    #[arg(long)]
    dns_upstream: Option<SocketAddr>,

    /// Applications that bypass the proxy, separated by commas
    #[arg(long, default_value = "tun2ray.exe")]
    exception_apps: String,

    /// Local address excepted traffic is sent from
    #[arg(long)]
    send_through: Option<SocketAddr>,

    /// TUN MTU
    #[arg(long, default_value_t = 1500)]
    mtu: u16,

    /// Log level (silent, error, warning, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let proxy = fs::read_to_string(&self.config)
            .with_context(|| format!("failed to read proxy config {}", self.config))?;

        Ok(EngineConfig {
            tun: TunConfig {
                name: self.tun_name.clone(),
                address: self.tun_addr,
                gateway: self.tun_gw,
                netmask: self.tun_mask,
                dns: parse_ip_list(&self.tun_dns)?,
                mtu: self.mtu,
            },
            proxy,
            sniffing: split_list(&self.sniffing_type),
            udp_enabled: !self.dns_fallback,
            udp_timeout_secs: self.udp_timeout,
            exception_apps: split_list(&self.exception_apps),
            send_through: self.send_through,
            dns_fallback: DnsFallbackConfig {
                upstream: self.dns_upstream,
                ..Default::default()
            },
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use futures::StreamExt;
    match signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
    ]) {
        Ok(mut signals) => {
            if let Some(signal) = signals.next().await {
                info!("Received signal {}", signal);
            }
        }
        Err(e) => {
            warn!("Failed to install signal handlers ({}), falling back to ctrl-c", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    let config = args.engine_config()?;
    let components = default_components(Arc::new(TunDeviceFactory));

    let engine = match Engine::start(config, components).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start ({}): {}", e.component(), e);
            return Err(e.into());
        }
    };
    info!("Running tun2ray");

    wait_for_signal().await;

    info!("Shutting down tun2ray...");
    engine.stop().await?;
    let stats = engine.stats();
    info!(
        "tun2ray stopped ({} flows, {} packets in, {} packets out)",
        stats.total_flows, stats.packets_in, stats.packets_out
    );
    Ok(())
}
