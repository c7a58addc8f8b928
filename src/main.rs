//! ethernet-io - Host side of a framed TCP control link
//!
//! Serves a single peer device over TCP, announces itself by UDP broadcast
//! while idle, and hands received control packets to a polling consumer.

mod config;
mod discovery;
mod network;
mod protocol;
mod session;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use discovery::{Discovery, DiscoveryEvent};
use network::{resolve_host, Peer, PeerConfig, PeerEvent, TransportServer};
use protocol::{ControlPacket, HostStatus, MainControls, PacketId};
use session::Session;

/// ethernet-io - framed TCP control link for a single peer device
#[derive(Parser)]
#[command(name = "ethernet-io")]
#[command(version = "0.1.0")]
#[command(about = "Serve a peer control device over a framed TCP link", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host: accept a peer and poll its control packets
    Serve {
        /// Port to listen on (default from config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Stay in NotInFlight and refuse control packets
        #[arg(long)]
        idle: bool,
    },

    /// Run a test peer against a host
    Peer {
        /// Host address, with or without port
        #[arg(short, long)]
        server: String,

        /// Host port when not part of the address
        #[arg(short, long)]
        port: Option<u16>,

        /// Interval between control packets (ms)
        #[arg(long, default_value_t = 100)]
        rate_ms: u64,
    },

    /// Listen for host announcements
    Discover {
        /// How long to listen (seconds)
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, idle } => {
            run_serve(config, port, idle).await?;
        }
        Commands::Peer {
            server,
            port,
            rate_ms,
        } => {
            run_peer(config, server, port, rate_ms).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config();
                if let Some(path) = output {
                    sample.save(&path)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample.to_toml()?);
                }
            } else {
                println!("{}", config.to_toml()?);
            }
        }
        Commands::Discover { timeout } => {
            run_discovery(config, timeout).await?;
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Run the host
async fn run_serve(config: Config, port: Option<u16>, idle: bool) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.network.port);
    let transport = TransportServer::new(config.transport_config(port)?)?;
    let events = transport
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("transport event receiver already taken"))?;

    transport.start()?;

    let session = Arc::new(Session::new(config.session_config(), transport.clone()));
    let tasks = session.spawn(events);

    session.update_status(HostStatus::NotInFlight);
    if !idle {
        session.set_control_acceptance(true);
        session.update_status(HostStatus::InFlight);
    }

    println!("\n========================================");
    println!("  ethernet-io Host Running");
    println!("========================================");
    println!("  Host: {}", config.general.name);
    if let Some(addr) = transport.local_addr() {
        println!("  Listening: {}", addr);
    }
    println!("  Status: {:?}", session.status());
    println!(
        "  Control: {}",
        if session.control_acceptance() { "accepted" } else { "refused" }
    );
    println!("========================================");
    println!("\nWaiting for a peer to connect...");
    println!("Press Ctrl+C to stop.\n");

    let mut refresh = tokio::time::interval(Duration::from_millis(config.session.refresh_ms.max(1)));

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                if let Some(packet) = session.poll_next() {
                    log_controls(&packet);

                    let mut stale = 0usize;
                    while session.poll_next().is_some() {
                        stale += 1;
                    }
                    if stale > 0 {
                        tracing::debug!("Skipped {} older control packets", stale);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    let pending = session.queued();
    if pending > 0 {
        tracing::debug!("Discarding {} queued control packets", pending);
    }
    session.set_control_acceptance(false);
    for task in tasks {
        task.abort();
    }
    transport.shutdown().await;
    tracing::info!("Host stopped");

    Ok(())
}

fn log_controls(packet: &ControlPacket) {
    let groups: Vec<u8> = (1..=10).filter(|&n| packet.control_group(n)).collect();

    tracing::debug!(
        "Controls {:?} groups={:?} ui={} camera={} sas={} speed={} menu={} map={}",
        packet.controls(),
        groups,
        packet.ui_mode(),
        packet.camera_mode(),
        packet.sas_mode(),
        packet.speed_mode(),
        packet.open_menu(),
        packet.open_map()
    );
    tracing::debug!(
        "Axes pitch={} roll={} yaw={} t=({},{},{}) steer={} throttle={} wheel={}",
        packet.pitch,
        packet.roll,
        packet.yaw,
        packet.tx,
        packet.ty,
        packet.tz,
        packet.wheel_steer,
        packet.throttle,
        packet.wheel_throttle
    );
}

/// Run the test peer
async fn run_peer(
    config: Config,
    server: String,
    port: Option<u16>,
    rate_ms: u64,
) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.network.port);
    let server_addr: SocketAddr = match server.parse() {
        Ok(addr) => addr,
        Err(_) => resolve_host(&server, port).await?,
    };

    let mut peer = Peer::new(PeerConfig::default());
    let mut events = peer
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("peer event receiver already taken"))?;

    println!("Connecting to {}...", server_addr);
    peer.connect(server_addr).await?;

    let mut rate = tokio::time::interval(Duration::from_millis(rate_ms.max(1)));
    let mut step: i16 = 0;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                match event {
                    PeerEvent::Connected { server_addr } => {
                        println!("+ Connected to {}", server_addr);
                    }
                    PeerEvent::StatusReceived(status) => {
                        tracing::info!("Host status: {:?}", status);
                    }
                    PeerEvent::PacketReceived(payload) => {
                        tracing::debug!("Packet from host: {:02x?}", &payload[..]);
                    }
                    PeerEvent::Disconnected { reason } => {
                        println!("- Disconnected: {}", reason);
                        break;
                    }
                }
            }
            _ = rate.tick() => {
                step = step.wrapping_add(256);
                let controls = MainControls {
                    sas: true,
                    lights: step < 0,
                    ..Default::default()
                };
                let packet = ControlPacket {
                    main_controls: controls.to_bits(),
                    throttle: step,
                    pitch: step / 2,
                    ..Default::default()
                };
                if let Err(e) = peer.send_control(&packet).await {
                    tracing::warn!("Control send failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    if peer.is_connected().await {
        peer.disconnect().await?;
    }

    Ok(())
}

/// Listen for host announcements
async fn run_discovery(config: Config, timeout_secs: u64) -> anyhow::Result<()> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.network.port);
    let mut discovery = Discovery::new(bind_addr);
    let mut events = discovery
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("discovery event receiver already taken"))?;

    discovery.start().await?;
    if let Some(addr) = discovery.local_addr() {
        println!("Listening on {}", addr);
    }
    println!("Scanning for hosts ({} seconds)...\n", timeout_secs);

    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                match event {
                    DiscoveryEvent::HostDiscovered(host) => {
                        println!("+ {} ({:?})", host.socket_addr(), host.status);
                    }
                    DiscoveryEvent::HostUpdated(host) => {
                        println!("~ {} ({:?})", host.socket_addr(), host.status);
                    }
                    DiscoveryEvent::HostLost(addr) => {
                        println!("- {}", addr);
                    }
                }
            }
            _ = &mut deadline => break,
        }
    }

    let hosts = discovery.discovered_hosts().await;
    discovery.stop().await?;

    println!("\nDiscovery complete: {} host(s) found.", hosts.len());
    Ok(())
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    let (m1, m2, m3) = protocol::HANDSHAKE_MARKERS;

    println!("ethernet-io Protocol Information");
    println!("================================\n");

    println!("Platform: {}", std::env::consts::OS);
    println!("Host: {}", config.general.name);
    println!("Port: {} (TCP and UDP broadcast)", config.network.port);
    println!();
    println!(
        "Frame: [{:#04X}][{:#04X}][size][payload][checksum]",
        protocol::HEADER_1,
        protocol::HEADER_2
    );
    println!("  Max payload: {} bytes", protocol::MAX_PAYLOAD_SIZE);
    println!("  Overhead: {} bytes", protocol::FRAME_OVERHEAD);
    println!("  Checksum: XOR of size and payload bytes");
    println!();
    println!("Packets:");
    println!("  Handshake = {} (peer markers {},{},{})", PacketId::Handshake as u8, m1, m2, m3);
    println!("  Status    = {}", PacketId::Status as u8);
    println!("  Control   = {} ({} bytes)", PacketId::Control as u8, ControlPacket::SIZE);
    println!();
    println!("Session:");
    println!("  Watchdog: {} ms", config.session.watchdog_timeout_ms);
    println!("  Handshake timeout: {} ms", config.session.handshake_timeout_ms);
    println!("  Broadcast interval: {} ms", config.session.broadcast_interval_ms);
}
