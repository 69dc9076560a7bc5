use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::detector::{DetectorEvent, PartitionMonitor, PartitionStatus};
use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::election::{ElectionMessage, ElectionNode};
use crate::error::{CoordError, Result};
use crate::peer::PeerRecord;

struct Wiring {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Main node that orchestrates all components
///
/// Owns one instance of each subsystem and the tasks that connect them:
///
/// 1. Discovery sightings count as heartbeats for the partition detector
/// 2. Discovered peers advertising an election port join the election peer
///    set; they leave it again when they expire or announce departure
///    (statically configured peers are never removed)
/// 3. Detector unreachability is forwarded to the election node, which
///    starts an election early if the unreachable peer is its leader, and
///    is mirrored on the discovery table as `PeerStatus::Unreachable`
pub struct Node {
    pub config: NodeConfig,
    pub discovery: Arc<DiscoveryService>,
    pub detector: Arc<PartitionMonitor>,
    pub election: Arc<ElectionNode>,
    wiring: Mutex<Option<Wiring>>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let detector = Arc::new(PartitionMonitor::from_config(&config));
        let election = Arc::new(ElectionNode::with_detector(
            config.clone(),
            detector.clone(),
        ));
        let discovery = Arc::new(DiscoveryService::new(config.clone()));

        Ok(Self {
            config,
            discovery,
            detector,
            election,
            wiring: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start discovery, then the detector, then the election node, and wire
    /// them together. On failure, components already started are stopped.
    pub async fn start(&self) -> Result<()> {
        let mut wiring = self.wiring.lock().await;
        if wiring.is_some() {
            return Err(CoordError::AlreadyStarted("node"));
        }

        // Subscribe first so no sighting made during startup is missed
        let discovery_rx = self.discovery.subscribe();
        let detector_rx = self.detector.subscribe();

        self.discovery.start().await?;
        if let Err(e) = self.detector.start().await {
            self.discovery.stop().await;
            return Err(e);
        }
        if let Err(e) = self.election.start().await {
            self.detector.stop().await;
            self.discovery.stop().await;
            return Err(e);
        }
        if let Some(addr) = self.election.local_addr().await {
            if addr.port() != self.config.election_port {
                self.discovery.advertise_election_port(addr.port()).await;
            }
        }

        let cancel = self.shutdown.child_token();
        let static_peers: BTreeSet<String> =
            self.config.peers.iter().map(|p| p.node_id.clone()).collect();

        let handles = vec![
            tokio::spawn(discovery_loop(
                discovery_rx,
                self.detector.clone(),
                self.election.clone(),
                static_peers,
                cancel.clone(),
            )),
            tokio::spawn(detector_loop(
                detector_rx,
                self.discovery.clone(),
                self.election.clone(),
                cancel.clone(),
            )),
        ];

        tracing::info!(node_id = %self.config.node_id, "Node started");
        *wiring = Some(Wiring { cancel, handles });
        Ok(())
    }

    /// Tear down in reverse start order. A no-op when not running.
    pub async fn stop(&self) {
        let wiring = self.wiring.lock().await.take();
        let Some(Wiring { cancel, handles }) = wiring else {
            return;
        };
        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }

        self.election.stop().await;
        self.detector.stop().await;
        self.discovery.stop().await;
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
    }

    /// Get the current leader ID, as known locally
    pub async fn get_leader(&self) -> Option<String> {
        self.election.get_leader().await
    }

    pub async fn is_leader(&self) -> bool {
        self.election.is_leader().await
    }

    pub async fn get_discovered_peers(&self) -> Vec<PeerRecord> {
        self.discovery.get_peers().await
    }

    pub async fn get_partition_status(&self) -> PartitionStatus {
        self.detector.get_partition_status().await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Feed discovery sightings into the detector and the election peer set.
async fn discovery_loop(
    mut events: broadcast::Receiver<DiscoveryEvent>,
    detector: Arc<PartitionMonitor>,
    election: Arc<ElectionNode>,
    static_peers: BTreeSet<String>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(DiscoveryEvent::PeerDiscovered(record)) | Ok(DiscoveryEvent::PeerUpdated(record)) => {
                detector.record_heartbeat(&record.peer_id).await;
                if let Some(addr) = record.election_addr() {
                    election.add_peer(&record.peer_id, addr).await;
                }
            }
            Ok(DiscoveryEvent::PeerExpired(peer_id)) | Ok(DiscoveryEvent::PeerLeft(peer_id)) => {
                if !static_peers.contains(&peer_id) {
                    election.remove_peer(&peer_id).await;
                    detector.untrack_peer(&peer_id).await;
                }
            }
            // Raised by our own detector, not by traffic from the peer
            Ok(DiscoveryEvent::PeerStatusChanged(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Discovery events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Forward unreachable peers to the election node as early-election hints
/// and keep the discovery table's reachability flag in step.
async fn detector_loop(
    mut events: broadcast::Receiver<DetectorEvent>,
    discovery: Arc<DiscoveryService>,
    election: Arc<ElectionNode>,
    token: CancellationToken,
) {
    let messages = election.message_sender();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(DetectorEvent::PeerUnreachable { peer_id, .. }) => {
                discovery.set_peer_unreachable(&peer_id, true).await;
                if messages
                    .send(ElectionMessage::LeaderUnreachable(peer_id))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(DetectorEvent::PeerReachable { peer_id })
            | Ok(DetectorEvent::PeerRejoined { peer_id }) => {
                discovery.set_peer_unreachable(&peer_id, false).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Detector events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
