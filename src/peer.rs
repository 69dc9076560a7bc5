use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a peer advertises in its presence broadcasts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    #[default]
    Worker,
    QueenCandidate,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Worker => write!(f, "worker"),
            PeerRole::QueenCandidate => write!(f, "queen-candidate"),
        }
    }
}

/// Availability a peer advertises (or that is assigned to it locally).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    #[default]
    Available,
    Busy,
    Unreachable,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Available => write!(f, "available"),
            PeerStatus::Busy => write!(f, "busy"),
            PeerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A peer known to the discovery service.
///
/// `host`/`port` are always the address the datagram was observed from, never
/// an address claimed inside the payload. Records handed out by the discovery
/// service are copies; mutating one has no effect on the live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    pub host: IpAddr,
    pub port: u16,
    pub role: PeerRole,
    pub capabilities: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    pub status: PeerStatus,
    /// Election RPC port the peer advertised, if it runs an election node.
    pub election_port: Option<u16>,
    pub last_seen_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Address of the peer's election endpoint, on the observed host.
    pub fn election_addr(&self) -> Option<SocketAddr> {
        self.election_port.map(|port| SocketAddr::new(self.host, port))
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PeerRecord {
        PeerRecord {
            peer_id: "a".to_string(),
            host: "10.0.0.7".parse().unwrap(),
            port: 41234,
            role: PeerRole::QueenCandidate,
            capabilities: ["compute".to_string()].into_iter().collect(),
            metadata: BTreeMap::new(),
            status: PeerStatus::Busy,
            election_port: Some(41236),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_addresses_use_observed_host() {
        let rec = record();
        assert_eq!(rec.addr().to_string(), "10.0.0.7:41234");
        assert_eq!(rec.election_addr().unwrap().to_string(), "10.0.0.7:41236");
        assert!(rec.has_capability("compute"));
        assert!(!rec.has_capability("storage"));
    }

    #[test]
    fn test_role_and_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&PeerRole::QueenCandidate).unwrap(),
            "\"queen-candidate\""
        );
        assert_eq!(
            serde_json::to_string(&PeerStatus::Unreachable).unwrap(),
            "\"unreachable\""
        );
        assert_eq!(PeerRole::Worker.to_string(), "worker");
        assert_eq!(PeerStatus::Busy.to_string(), "busy");
    }
}
