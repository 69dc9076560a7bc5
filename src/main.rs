use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use aware_lite::config::{NodeConfig, PeerConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_ELECTION_PORT};
use aware_lite::discovery::DiscoveryService;
use aware_lite::node::Node;
use aware_lite::peer::PeerRecord;
use aware_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "aware-lite")]
#[command(version)]
#[command(about = "Peer discovery, leader election and partition detection over UDP")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a coordination node until SIGINT/SIGTERM
    Server(ServerArgs),

    /// Listen for presence broadcasts for a while and print the peers heard
    Discover(DiscoverArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node, random when omitted)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Address to bind both UDP sockets on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// UDP port for discovery traffic
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    port: u16,

    /// UDP port for election traffic
    #[arg(long, default_value_t = DEFAULT_ELECTION_PORT)]
    election_port: u16,

    /// Election peers (comma-separated, format: "id:host:port")
    /// Example: "b:127.0.0.1:41237,c:127.0.0.1:41238"
    #[arg(long, env = "NODE_LIST", default_value = "")]
    peers: String,

    /// Unicast discovery seeds (comma-separated "host:port")
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<SocketAddr>,

    /// Broadcast address for presence messages
    #[arg(long, default_value = "255.255.255.255")]
    broadcast_address: IpAddr,

    /// Rely on seeds only
    #[arg(long)]
    no_broadcast: bool,

    /// Capabilities to advertise (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "compute,storage")]
    capabilities: Vec<String>,

    #[arg(long, default_value_t = 300)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 600)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 100)]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    heartbeat_timeout_ms: u64,

    /// Log a status line every N seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,
}

#[derive(Parser, Debug)]
struct DiscoverArgs {
    /// UDP port to listen on
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    port: u16,

    /// Unicast discovery seeds (comma-separated "host:port")
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<SocketAddr>,

    /// How long to listen
    #[arg(long, default_value_t = 3)]
    wait_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let peer = peer.trim();
            let parsed = peer
                .split_once(':')
                .and_then(|(id, addr)| Some((id, addr.parse::<SocketAddr>().ok()?)));
            match parsed {
                Some((node_id, addr)) if !node_id.is_empty() => Some(PeerConfig {
                    node_id: node_id.to_string(),
                    addr,
                }),
                _ => {
                    tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                    None
                }
            }
        })
        .collect()
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match args.node_id {
        Some(id) => NodeConfig::new(id),
        None => NodeConfig::default(),
    };
    config.bind_host = args.bind;
    config.listen_port = args.port;
    config.broadcast_port = args.port;
    config.election_port = args.election_port;
    config.broadcast_address = args.broadcast_address;
    config.broadcast_enabled = !args.no_broadcast;
    config.seeds = args.seeds;
    config.peers = parse_peers(&args.peers);
    config.capabilities = args.capabilities.into_iter().collect();
    config.election_timeout_min_ms = args.election_timeout_min_ms;
    config.election_timeout_max_ms = args.election_timeout_max_ms;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.heartbeat_timeout_ms = args.heartbeat_timeout_ms;

    tracing::info!(
        node_id = %config.node_id,
        discovery_addr = %config.discovery_addr(),
        election_addr = %config.election_addr(),
        peers = ?config.peers.iter().map(|p| format!("{}@{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting aware-lite node"
    );

    let node = Node::new(config)?;
    let shutdown = install_shutdown_handler();
    node.start().await?;

    let period = Duration::from_secs(args.status_interval_secs.max(1));
    let mut status = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = status.tick(), if args.status_interval_secs > 0 => {
                let partition = node.get_partition_status().await;
                tracing::info!(
                    leader = ?node.get_leader().await,
                    term = node.election.current_term().await,
                    peers = node.get_discovered_peers().await.len(),
                    unreachable = ?partition.unreachable,
                    "Status"
                );
            }
        }
    }

    node.stop().await;
    Ok(())
}

async fn run_discover(args: DiscoverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(format!("discover-{}", uuid::Uuid::new_v4()));
    config.listen_port = args.port;
    config.broadcast_port = args.port;
    config.seeds = args.seeds;
    // Listen only, no election endpoint to advertise
    config.election_port = 0;

    let service = DiscoveryService::new(config);
    service.start().await?;
    tokio::time::sleep(Duration::from_secs(args.wait_secs)).await;
    let peers = service.get_peers().await;
    service.stop().await;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&peers)?),
        OutputFormat::Table => print_peer_table(&peers),
    }
    Ok(())
}

fn print_peer_table(peers: &[PeerRecord]) {
    if peers.is_empty() {
        println!("No peers found");
        return;
    }
    println!(
        "{:<38} {:<22} {:<16} {:<12} {}",
        "PEER", "ADDRESS", "ROLE", "STATUS", "CAPABILITIES"
    );
    for peer in peers {
        println!(
            "{:<38} {:<22} {:<16} {:<12} {}",
            peer.peer_id,
            peer.addr().to_string(),
            peer.role.to_string(),
            peer.status.to_string(),
            peer.capabilities.iter().cloned().collect::<Vec<_>>().join(",")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Discover(discover_args) => run_discover(discover_args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers("b:127.0.0.1:41237, c:10.0.0.3:41236");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, "b");
        assert_eq!(peers[0].addr, "127.0.0.1:41237".parse().unwrap());
        assert_eq!(peers[1].node_id, "c");
    }

    #[test]
    fn test_parse_peers_skips_invalid() {
        assert!(parse_peers("").is_empty());
        let peers = parse_peers("nohost,:127.0.0.1:1,d:127.0.0.1:9");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "d");
    }
}
