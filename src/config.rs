use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{CoordError, Result};
use crate::peer::PeerRole;

/// Default UDP port for discovery traffic.
pub const DEFAULT_DISCOVERY_PORT: u16 = 41234;

/// Default UDP port for election traffic.
pub const DEFAULT_ELECTION_PORT: u16 = 41236;

/// A statically configured election peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: SocketAddr,
}

/// Configuration for a single coordination node.
///
/// Covers all three subsystems. Discovery uses `listen_port`, the broadcast
/// target and `seeds`; the election coordinator uses `election_port` and
/// `peers`; the partition detector uses the heartbeat timeout and threshold.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_host: IpAddr,

    // === Discovery ===
    pub listen_port: u16,
    pub broadcast_address: IpAddr,
    pub broadcast_port: u16,
    /// Disable to rely on `seeds` only (e.g. networks without broadcast).
    pub broadcast_enabled: bool,
    /// Unicast targets that receive every presence broadcast.
    pub seeds: Vec<SocketAddr>,
    pub role: PeerRole,
    pub capabilities: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    pub broadcast_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub node_timeout_ms: u64,
    pub bind_timeout_ms: u64,

    // === Election ===
    pub election_port: u16,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub request_vote_timeout_ms: u64,

    // === Partition detection ===
    pub heartbeat_timeout_ms: u64,
    pub partition_detection_threshold: u32,
    /// Defaults to half the heartbeat timeout when unset.
    pub partition_check_interval_ms: Option<u64>,
    /// Unicast heartbeats to known peers. Defaults to a third of the
    /// heartbeat timeout when unset.
    pub peer_heartbeat_interval_ms: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_port: DEFAULT_DISCOVERY_PORT,
            broadcast_enabled: true,
            seeds: Vec::new(),
            role: PeerRole::Worker,
            capabilities: ["compute", "storage"].iter().map(|c| c.to_string()).collect(),
            metadata: BTreeMap::new(),
            broadcast_interval_ms: 10_000,
            sweep_interval_ms: 60_000,
            node_timeout_ms: 120_000,
            bind_timeout_ms: 1_000,
            election_port: DEFAULT_ELECTION_PORT,
            peers: Vec::new(),
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            heartbeat_interval_ms: 100,
            request_vote_timeout_ms: 200,
            heartbeat_timeout_ms: 5_000,
            partition_detection_threshold: 3,
            partition_check_interval_ms: None,
            peer_heartbeat_interval_ms: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: impl Into<String>, addr: SocketAddr) -> Self {
        self.peers.push(PeerConfig {
            node_id: node_id.into(),
            addr,
        });
        self
    }

    pub fn with_seed(mut self, addr: SocketAddr) -> Self {
        self.seeds.push(addr);
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Check the timing relationships the protocols depend on.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(CoordError::InvalidConfig("node_id must not be empty".into()));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(CoordError::InvalidConfig(format!(
                "election timeout range is inverted: [{}, {}]",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(CoordError::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be non-zero and shorter than the election timeout lower bound ({}ms)",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.request_vote_timeout_ms == 0 {
            return Err(CoordError::InvalidConfig(
                "request_vote_timeout_ms must be non-zero".into(),
            ));
        }
        if self.broadcast_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(CoordError::InvalidConfig(
                "discovery intervals must be non-zero".into(),
            ));
        }
        if self.node_timeout_ms < 4 * self.broadcast_interval_ms {
            return Err(CoordError::InvalidConfig(format!(
                "node_timeout_ms ({}) must be at least 4x the broadcast interval ({})",
                self.node_timeout_ms, self.broadcast_interval_ms
            )));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(CoordError::InvalidConfig(
                "heartbeat_timeout_ms must be non-zero".into(),
            ));
        }
        // Losing a single heartbeat must not leave a peer silent for a
        // whole timeout
        let peer_heartbeat = self.peer_heartbeat_interval().as_millis() as u64;
        if 2 * peer_heartbeat > self.heartbeat_timeout_ms {
            return Err(CoordError::InvalidConfig(format!(
                "peer heartbeat interval ({}ms) must be at most half the heartbeat timeout ({}ms)",
                peer_heartbeat, self.heartbeat_timeout_ms
            )));
        }
        if self.partition_detection_threshold == 0 {
            return Err(CoordError::InvalidConfig(
                "partition_detection_threshold must be at least 1".into(),
            ));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(CoordError::InvalidConfig(
                "peer list must not contain the local node".into(),
            ));
        }
        Ok(())
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.listen_port)
    }

    pub fn election_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.election_port)
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.broadcast_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_vote_timeout(&self) -> Duration {
        Duration::from_millis(self.request_vote_timeout_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn peer_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.peer_heartbeat_interval_ms
                .unwrap_or(self.heartbeat_timeout_ms / 3)
                .max(1),
        )
    }

    pub fn partition_check_interval(&self) -> Duration {
        Duration::from_millis(
            self.partition_check_interval_ms
                .unwrap_or(self.heartbeat_timeout_ms / 2)
                .max(1),
        )
    }
}
