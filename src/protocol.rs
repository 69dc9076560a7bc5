//! Wire format shared by discovery and election traffic.
//!
//! Every datagram is a single compact JSON object carrying a `type` tag, the
//! sender's `nodeId` and a millisecond `timestamp`, followed by the fields of
//! its payload:
//!
//! ```json
//! {"nodeId":"a","timestamp":1700000000000,"version":"1.0","type":"heartbeat"}
//! ```
//!
//! [`Envelope::decode`] is the only way in. It fails with
//! [`CoordError::MalformedMessage`] for anything that is not a well-formed
//! message, and callers drop such datagrams.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::election::log::LogEntry;
use crate::error::{CoordError, Result};
use crate::peer::{PeerRole, PeerStatus};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// A protocol message together with its sender and send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub timestamp: i64,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    PresenceBroadcast(Presence),
    NodeDiscovery,
    NodeResponse(Presence),
    Heartbeat,
    NodeLeave { reason: String },
    RequestVote(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

/// What a node advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub capabilities: BTreeSet<String>,
    pub status: PeerStatus,
    #[serde(default)]
    pub role: PeerRole,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_port: Option<u16>,
    /// Address the sender claims to be reachable at. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: Option<u64>,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Unified heartbeat/replication message. A heartbeat has no entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: Option<u64>,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: Option<u64>,
}

impl Payload {
    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PresenceBroadcast(_) => "presence_broadcast",
            Payload::NodeDiscovery => "node_discovery",
            Payload::NodeResponse(_) => "node_response",
            Payload::Heartbeat => "heartbeat",
            Payload::NodeLeave { .. } => "node_leave",
            Payload::RequestVote(_) => "request_vote",
            Payload::VoteResponse(_) => "vote_response",
            Payload::AppendEntries(_) => "append_entries",
            Payload::AppendEntriesResponse(_) => "append_entries_response",
        }
    }

    /// Whether this message belongs to the election exchange.
    pub fn is_election(&self) -> bool {
        matches!(
            self,
            Payload::RequestVote(_)
                | Payload::VoteResponse(_)
                | Payload::AppendEntries(_)
                | Payload::AppendEntriesResponse(_)
        )
    }
}

impl Envelope {
    /// Wrap a payload, stamped with the current wall-clock time.
    pub fn new(node_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            version: default_version(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(raw)
            .map_err(|e| CoordError::MalformedMessage(e.to_string()))?;

        if envelope.node_id.trim().is_empty() {
            return Err(CoordError::MalformedMessage("empty nodeId".into()));
        }
        if envelope.timestamp <= 0 {
            return Err(CoordError::MalformedMessage(format!(
                "invalid timestamp {}",
                envelope.timestamp
            )));
        }
        match &envelope.payload {
            Payload::RequestVote(req) if req.candidate_id.is_empty() => {
                return Err(CoordError::MalformedMessage("empty candidateId".into()));
            }
            Payload::AppendEntries(req) if req.leader_id.is_empty() => {
                return Err(CoordError::MalformedMessage("empty leaderId".into()));
            }
            _ => {}
        }

        Ok(envelope)
    }
}
