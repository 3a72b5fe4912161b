//! CLI command definitions and handlers.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::{Notify, mpsc};
use tracing::{info, warn};

use netlink_core::config::NetConfig;
use netlink_core::discovery::{DiscoveryService, PEER_TIMEOUT};
use netlink_core::transfer::partial::cleanup_stale_partials;
use netlink_core::transfer::utils::{format_size, format_transfer_speed};
use netlink_core::transfer::{RetryPolicy, TransferClient, TransferServer};
use netlink_core::{TransferEvent, TransferProgress};

#[derive(Parser)]
#[command(name = "netlink", version, about = "Send files between machines on a LAN")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Receive files and announce this machine
    Receive(ReceiveArgs),
    /// Send files or directories to a peer
    Send(SendArgs),
    /// List machines announcing themselves
    Discover(DiscoverArgs),
    /// Delete abandoned .partial files
    CleanPartials(CleanArgs),
}

#[derive(Args)]
pub struct ReceiveArgs {
    /// Port to accept transfers on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Where received files are stored
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Name announced to other machines
    #[arg(short, long, env = "NETLINK_NAME")]
    pub name: Option<String>,

    /// Listen for peers but do not announce
    #[arg(long)]
    pub no_announce: bool,

    /// Announce with UDP broadcast only
    #[arg(long)]
    pub broadcast_only: bool,
}

#[derive(Args)]
pub struct SendArgs {
    /// Peer name, host, or host:port
    pub target: String,

    /// Files and directories to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Transfer port when the target has none
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Use the non-resumable single-file protocol
    #[arg(long)]
    pub legacy: bool,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 3)]
    pub attempts: u32,
}

#[derive(Args)]
pub struct DiscoverArgs {
    /// How long to listen
    #[arg(short, long, default_value_t = 5)]
    pub seconds: u64,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Directory to scan (defaults to the download directory)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Minimum age in days
    #[arg(long)]
    pub days: Option<u64>,
}

pub async fn receive(args: ReceiveArgs) -> Result<()> {
    let mut config = NetConfig::load();
    if let Some(port) = args.port {
        config.transfer_port = port;
    }
    if let Some(dir) = args.dir {
        config.download_dir = dir;
    }
    if let Some(name) = args.name {
        config.machine_name = name;
    }
    config.announce &= !args.no_announce;
    config.broadcast_only |= args.broadcast_only;

    if config.auto_cleanup_partial {
        match cleanup_stale_partials(&config.download_dir, config.partial_max_age()) {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale partial files", n),
            Err(e) => warn!("Partial cleanup failed: {}", e),
        }
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.transfer_port));
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let server = TransferServer::bind(addr, config.download_dir.clone())
        .await
        .with_context(|| format!("could not listen on {}", addr))?
        .with_events(events_tx);
    let server = server.spawn()?;

    let mut discovery = DiscoveryService::new(config.discovery_config());
    discovery.start().await;

    println!(
        "Receiving as '{}' on port {} into {}",
        config.machine_name,
        server.local_addr().port(),
        config.download_dir.display()
    );
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events_rx.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    println!();
    discovery.stop().await;
    server.stop().await;
    Ok(())
}

fn print_event(event: &TransferEvent) {
    match event {
        TransferEvent::Status(status) => println!("{}", status),
        TransferEvent::Progress(progress) => print_progress(progress),
        TransferEvent::FileReceived {
            file_name, size, ..
        } => println!("\nReceived {} ({})", file_name, format_size(*size)),
        TransferEvent::ResumePending {
            file_name,
            received,
            size,
        } => println!(
            "\nInterrupted {} at {}/{}, will resume on the next attempt",
            file_name,
            format_size(*received),
            format_size(*size)
        ),
        TransferEvent::Error(message) => eprintln!("\nError: {}", message),
    }
}

fn print_progress(progress: &TransferProgress) {
    let eta = progress
        .total_eta
        .map_or_else(|| "--".to_string(), |secs| format!("{:.0}s", secs));
    eprint!(
        "\r{} {:5.1}% | {}/{} | {} | ETA {}   ",
        progress.file_name,
        progress.percent(),
        format_size(progress.total_sent),
        format_size(progress.total_size),
        format_transfer_speed(progress.speed as u64, 1.0),
        eta
    );
}

pub async fn send(args: SendArgs) -> Result<()> {
    let config = NetConfig::load();
    let default_port = args.port.unwrap_or(config.transfer_port);
    let (host, port) = resolve_target(&args.target, default_port, &config).await;

    for path in &args.paths {
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
    }

    let client = TransferClient::new(host.clone(), port)
        .with_retry_policy(RetryPolicy::default().with_max_attempts(args.attempts));
    let progress = |p: &TransferProgress| print_progress(p);

    println!("Sending to {}:{}", host, port);
    if args.legacy {
        for path in &args.paths {
            let report = client.send_file_legacy(path, &progress).await?;
            println!("\nSent {} ({})", report.file_name, format_size(report.size));
        }
        return Ok(());
    }

    let report = client.send_paths(&args.paths, &progress).await?;
    println!(
        "\nSent {} file(s), {} on the wire",
        report.files.len(),
        format_size(report.bytes_sent)
    );
    Ok(())
}

/// Map `target` to a host and port.
///
/// `host:port` and IP addresses are used as is. Anything else is first looked
/// up as a peer name, then treated as a hostname.
async fn resolve_target(target: &str, default_port: u16, config: &NetConfig) -> (String, u16) {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Ok(ip) = target.parse::<std::net::IpAddr>() {
        return (ip.to_string(), default_port);
    }
    if let Some((host, port)) = target.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (host.to_string(), port);
        }
    }

    let mut discovery = DiscoveryService::new(config.discovery_config().with_announce(false));
    discovery.start().await;
    let mut found = None;
    for _ in 0..PEER_TIMEOUT.as_millis() / 250 {
        if let Some(addr) = discovery.peer_addr(target) {
            found = Some(addr);
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    discovery.stop().await;

    match found {
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => {
            info!("No peer named '{}', using it as a hostname", target);
            (target.to_string(), default_port)
        }
    }
}

pub async fn discover(args: DiscoverArgs) -> Result<()> {
    let config = NetConfig::load();
    let changed = Arc::new(Notify::new());
    let notify = changed.clone();

    let mut discovery =
        DiscoveryService::new(config.discovery_config()).with_callback(move || notify.notify_one());
    discovery.start().await;
    if let Err(e) = discovery.send_beacon_once().await {
        warn!("Initial beacon failed: {}", e);
    }

    println!("Listening for {}s...", args.seconds);
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            _ = changed.notified() => print_peers(&discovery),
        }
    }

    discovery.stop().await;
    println!("Final peer list:");
    print_peers(&discovery);
    Ok(())
}

fn print_peers(discovery: &DiscoveryService) {
    let mut peers: Vec<_> = discovery.peers().into_iter().collect();
    peers.sort_by(|a, b| a.0.cmp(&b.0));
    if peers.is_empty() {
        println!("  (no peers)");
    }
    for (name, peer) in peers {
        println!(
            "  {:<24} {}:{}  seen {:.1}s ago",
            name,
            peer.ip,
            peer.port,
            peer.last_seen.elapsed().as_secs_f64()
        );
    }
}

pub fn clean_partials(args: CleanArgs) -> Result<()> {
    let config = NetConfig::load();
    let dir = args.dir.unwrap_or_else(|| config.download_dir.clone());
    let max_age = match args.days {
        Some(days) => Duration::from_secs(days.saturating_mul(86_400)),
        None => config.partial_max_age(),
    };

    let removed = cleanup_stale_partials(&dir, max_age)
        .with_context(|| format!("cleanup of {} failed", dir.display()))?;
    println!("Removed {} partial file(s) from {}", removed, dir.display());
    Ok(())
}
