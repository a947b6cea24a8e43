//! hopmesh node binary.
//!
//! Runs a mesh router over TCP. Peers are found through a static peer list;
//! a line-based console on stdin lists peers and sends text over routed
//! connections.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use mesh_routing::{DiscoveryModule, PeerInfo, Router, RouterEvent, RouterHandle};
use mesh_session::Connection;
use mesh_wire::PeerId;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod discovery;

use config::{NodeConfig, StaticPeer};
use discovery::{StaticPeerBrowser, TcpAdvertiser};
use logging::HopmeshLogFormatter;

/// Mesh node with link-state routing and multi-hop connections
#[derive(Parser, Debug)]
#[command(name = "hopmesh", version, about = "Peer-to-peer mesh node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "hopmesh.yaml")]
    config: PathBuf,

    /// Node identifier (UUID), random when unset
    #[arg(long)]
    node_id: Option<PeerId>,

    /// Node name sent to neighbors
    #[arg(long)]
    name: Option<String>,

    /// Listen address, e.g. 0.0.0.0:7420
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Static peer as <id>@<addr>[/<cost>] (repeatable)
    #[arg(long = "peer")]
    peers: Vec<StaticPeer>,

    /// Default link cost
    #[arg(long)]
    link_cost: Option<u32>,

    /// Link-state broadcast delay after a topology change, e.g. 5s
    #[arg(long)]
    broadcast_short_delay: Option<humantime::Duration>,

    /// Periodic link-state broadcast interval, e.g. 60s
    #[arg(long)]
    broadcast_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line flags take precedence over file and environment
    fn apply(self, config: &mut NodeConfig) {
        if let Some(id) = self.node_id {
            config.node_id = Some(id);
        }
        if let Some(name) = self.name {
            config.node_name = name;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if let Some(cost) = self.link_cost {
            config.link_cost = cost;
        }
        if let Some(delay) = self.broadcast_short_delay {
            config.broadcast_short_delay = delay.into();
        }
        if let Some(interval) = self.broadcast_interval {
            config.broadcast_interval = interval.into();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("hopmesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_routing={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_topology={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(HopmeshLogFormatter::new("hopmesh"))
        .init();

    info!("Starting hopmesh v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut node_config);
    let local_id = node_config.node_id.unwrap_or_else(PeerId::random);
    info!(
        "Node {} ({}) listening on {} with {} static peers",
        local_id,
        node_config.node_name,
        node_config.listen,
        node_config.peers.len()
    );

    let (router, handle, mut events) = Router::new(node_config.router_config(local_id));
    let router_task = tokio::spawn(router.run());

    let peers = node_config
        .peers
        .iter()
        .map(|peer| (peer.clone(), node_config.cost_of(peer)))
        .collect();
    let module = DiscoveryModule::new(
        "tcp",
        Arc::new(TcpAdvertiser::new(node_config.listen)),
        Arc::new(StaticPeerBrowser::new(peers, node_config.announce_interval)),
    );
    handle.add_module(module).await?;
    handle.start().await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report_event(event),
                None => break,
            },
            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => {
                    component_debug!("console", "stdin closed, console disabled");
                    console_open = false;
                }
                Err(e) => {
                    component_warn!("console", "Failed to read stdin: {}", e);
                    console_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    if let Err(e) = handle.shutdown().await {
        component_warn!("router", "Shutdown: {}", e);
    }
    match tokio::time::timeout(Duration::from_secs(5), router_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Router task failed: {}", e),
        Err(_) => component_warn!("router", "Router did not stop in time"),
    }
    info!("hopmesh stopped");
    Ok(())
}

fn describe(peer: &PeerInfo) -> String {
    match &peer.name {
        Some(name) => format!("{} ({})", name, peer.id),
        None => peer.id.to_string(),
    }
}

fn report_event(event: RouterEvent) {
    match event {
        RouterEvent::PeerFound(peer) => {
            component_info!("router", "Found {} at cost {:?}", describe(&peer), peer.cost);
        }
        RouterEvent::PeerImprovedRoute(peer) => {
            component_info!(
                "router",
                "Better route to {}: cost {:?} via {:?}",
                describe(&peer),
                peer.cost,
                peer.next_hop
            );
        }
        RouterEvent::PeerLost(peer) => {
            component_info!("router", "Lost {}", describe(&peer));
        }
        RouterEvent::IncomingConnection { from, connection } => {
            component_info!("router", "Incoming connection {} from {}", connection.id(), describe(&from));
            tokio::spawn(print_received(describe(&from), connection));
        }
    }
}

/// Print everything that arrives on a connection
async fn print_received(from: String, mut connection: Connection) {
    while let Ok(data) = connection.recv().await {
        println!("[{}] {}", from, String::from_utf8_lossy(&data));
    }
    component_debug!("console", "Connection {} with {} closed", connection.id(), from);
}

/// Execute one console line; false ends the program
async fn run_command(handle: &RouterHandle, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "peers" => match handle.peers().await {
            Ok(peers) => match serde_json::to_string_pretty(&peers) {
                Ok(json) => println!("{}", json),
                Err(e) => component_warn!("console", "Failed to render peers: {}", e),
            },
            Err(e) => component_warn!("console", "{}", e),
        },
        "send" => {
            if let Err(e) = send(handle, rest).await {
                component_warn!("console", "send failed: {:#}", e);
            }
        }
        "quit" | "exit" => return false,
        _ => println!("commands: peers | send <id>[,<id>...] <text> | quit"),
    }
    true
}

async fn send(handle: &RouterHandle, args: &str) -> anyhow::Result<()> {
    let (ids, text) = args
        .trim()
        .split_once(' ')
        .context("usage: send <id>[,<id>...] <text>")?;
    let destinations = ids
        .split(',')
        .map(|id| id.trim().parse::<PeerId>())
        .collect::<Result<BTreeSet<_>, _>>()
        .context("invalid peer id")?;

    let connection = handle.establish_connection(destinations).await?;
    connection.write(Bytes::from(text.to_string()))?;
    component_info!("console", "Sent {} bytes over {}", text.len(), connection.id());
    tokio::spawn(print_received("reply".to_string(), connection));
    Ok(())
}
