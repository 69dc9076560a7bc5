use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

const EVENT_CAPACITY: usize = 256;

/// Reachability transitions raised by the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    PeerUnreachable {
        peer_id: String,
        missed_heartbeats: u32,
        since_last_heartbeat: Duration,
    },
    PeerReachable {
        peer_id: String,
    },
    PeerRejoined {
        peer_id: String,
    },
    PartitionDetected {
        unreachable: Vec<String>,
        detected_at: DateTime<Utc>,
    },
    PartitionResolved {
        duration: Duration,
        detected_at: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHealth {
    pub missed_heartbeat_count: u32,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Read-only snapshot of the detector's aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStatus {
    pub is_partitioned: bool,
    pub unreachable: BTreeSet<String>,
    pub partition_detected_at: Option<DateTime<Utc>>,
    pub partition_resolved_at: Option<DateTime<Utc>>,
    pub peers: BTreeMap<String, PeerHealth>,
}

#[derive(Debug, Clone)]
struct Tracked {
    missed: u32,
    last_heartbeat: Instant,
}

/// Heartbeat-driven reachability classifier with hysteresis.
///
/// A peer is declared unreachable only after `threshold` consecutive sweeps
/// found it silent for longer than `heartbeat_timeout`, and becomes
/// reachable again on its next heartbeat. `PartitionDetected` fires once when
/// the unreachable set goes from empty to non-empty; `PartitionResolved`
/// fires once when it drains again.
///
/// The clock is passed in by the caller, so the detector itself never reads
/// time and can be driven deterministically.
#[derive(Debug)]
pub struct PartitionDetector {
    local_id: String,
    heartbeat_timeout: Duration,
    threshold: u32,
    peers: BTreeMap<String, Tracked>,
    unreachable: BTreeSet<String>,
    detected_at: Option<Instant>,
    resolved_at: Option<Instant>,
    origin: Instant,
    origin_wall: DateTime<Utc>,
    events: broadcast::Sender<DetectorEvent>,
}

impl PartitionDetector {
    /// Create a detector with every listed peer considered reachable as of `now`.
    pub fn new(
        local_id: impl Into<String>,
        peers: impl IntoIterator<Item = String>,
        heartbeat_timeout: Duration,
        threshold: u32,
        now: Instant,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut detector = Self {
            local_id: local_id.into(),
            heartbeat_timeout,
            threshold: threshold.max(1),
            peers: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            detected_at: None,
            resolved_at: None,
            origin: now,
            origin_wall: Utc::now(),
            events,
        };
        for peer in peers {
            detector.track_peer(&peer, now);
        }
        detector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<DetectorEvent> {
        self.events.clone()
    }

    /// Start tracking a peer, treating it as freshly heard from.
    pub fn track_peer(&mut self, peer_id: &str, now: Instant) {
        if peer_id == self.local_id {
            return;
        }
        self.peers.entry(peer_id.to_string()).or_insert(Tracked {
            missed: 0,
            last_heartbeat: now,
        });
    }

    /// Stop tracking a peer that left the membership.
    pub fn untrack_peer(&mut self, peer_id: &str, now: Instant) {
        self.peers.remove(peer_id);
        if self.unreachable.remove(peer_id) {
            self.resolve_if_drained(now);
        }
    }

    pub fn record_heartbeat(&mut self, peer_id: &str, now: Instant) {
        if peer_id == self.local_id {
            return;
        }
        let tracked = self.peers.entry(peer_id.to_string()).or_insert(Tracked {
            missed: 0,
            last_heartbeat: now,
        });
        tracked.missed = 0;
        tracked.last_heartbeat = now;

        if self.unreachable.remove(peer_id) {
            tracing::info!(peer_id = %peer_id, "Peer reachable again");
            self.emit(DetectorEvent::PeerReachable {
                peer_id: peer_id.to_string(),
            });
            self.resolve_if_drained(now);
        }
    }

    /// Periodic sweep: count missed heartbeats and classify silent peers.
    pub fn check_for_partitions(&mut self, now: Instant) {
        let mut newly_unreachable = Vec::new();

        for (peer_id, tracked) in self.peers.iter_mut() {
            let silent_for = now.saturating_duration_since(tracked.last_heartbeat);
            if silent_for > self.heartbeat_timeout {
                tracked.missed = tracked.missed.saturating_add(1);
                if tracked.missed >= self.threshold && !self.unreachable.contains(peer_id) {
                    newly_unreachable.push((peer_id.clone(), tracked.missed, silent_for));
                }
            } else {
                tracked.missed = 0;
            }
        }

        for (peer_id, missed, silent_for) in newly_unreachable {
            tracing::info!(
                peer_id = %peer_id,
                missed_heartbeats = missed,
                silent_ms = silent_for.as_millis() as u64,
                "Peer unreachable"
            );
            self.unreachable.insert(peer_id.clone());
            self.emit(DetectorEvent::PeerUnreachable {
                peer_id,
                missed_heartbeats: missed,
                since_last_heartbeat: silent_for,
            });
        }

        if !self.unreachable.is_empty() && self.detected_at.is_none() {
            self.detected_at = Some(now);
            let detected_at = self.wall(now);
            tracing::warn!(
                unreachable = ?self.unreachable,
                "Network partition detected"
            );
            self.emit(DetectorEvent::PartitionDetected {
                unreachable: self.unreachable.iter().cloned().collect(),
                detected_at,
            });
        }

        self.resolve_if_drained(now);
    }

    /// Explicitly mark a previously unreachable peer as back.
    pub fn handle_node_rejoin(&mut self, peer_id: &str, now: Instant) {
        if !self.unreachable.remove(peer_id) {
            return;
        }
        if let Some(tracked) = self.peers.get_mut(peer_id) {
            tracked.missed = 0;
            tracked.last_heartbeat = now;
        }
        tracing::info!(peer_id = %peer_id, "Peer rejoined");
        self.emit(DetectorEvent::PeerRejoined {
            peer_id: peer_id.to_string(),
        });
        self.resolve_if_drained(now);
    }

    pub fn is_unreachable(&self, peer_id: &str) -> bool {
        self.unreachable.contains(peer_id)
    }

    pub fn unreachable_peers(&self) -> Vec<String> {
        self.unreachable.iter().cloned().collect()
    }

    pub fn missed_heartbeats(&self, peer_id: &str) -> Option<u32> {
        self.peers.get(peer_id).map(|t| t.missed)
    }

    pub fn status(&self) -> PartitionStatus {
        PartitionStatus {
            is_partitioned: !self.unreachable.is_empty(),
            unreachable: self.unreachable.clone(),
            partition_detected_at: self.detected_at.map(|at| self.wall(at)),
            partition_resolved_at: self.resolved_at.map(|at| self.wall(at)),
            peers: self
                .peers
                .iter()
                .map(|(id, t)| {
                    (
                        id.clone(),
                        PeerHealth {
                            missed_heartbeat_count: t.missed,
                            last_heartbeat_at: self.wall(t.last_heartbeat),
                        },
                    )
                })
                .collect(),
        }
    }

    fn resolve_if_drained(&mut self, now: Instant) {
        if !self.unreachable.is_empty() {
            return;
        }
        let Some(detected) = self.detected_at.take() else {
            return;
        };
        self.resolved_at = Some(now);
        let duration = now.saturating_duration_since(detected);
        tracing::info!(
            duration_ms = duration.as_millis() as u64,
            "Network partition resolved"
        );
        self.emit(DetectorEvent::PartitionResolved {
            duration,
            detected_at: self.wall(detected),
            resolved_at: self.wall(now),
        });
    }

    /// Map a monotonic instant onto wall-clock time.
    fn wall(&self, at: Instant) -> DateTime<Utc> {
        let offset = at.saturating_duration_since(self.origin);
        self.origin_wall + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn emit(&self, event: DetectorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
