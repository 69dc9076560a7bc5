use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::discovery::table::{PeerTable, Upsert};
use crate::error::{CoordError, Result};
use crate::peer::{PeerRecord, PeerStatus};
use crate::protocol::{Envelope, Payload, Presence, MAX_DATAGRAM_SIZE};
use crate::transport::{bind_socket, send_envelope};

const EVENT_CAPACITY: usize = 256;

/// Changes to the discovered peer set.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    PeerDiscovered(PeerRecord),
    /// A known peer was heard from again.
    PeerUpdated(PeerRecord),
    /// Silent for longer than the node timeout.
    PeerExpired(String),
    /// Announced its own departure.
    PeerLeft(String),
    /// Flagged or cleared as unreachable locally; no traffic was received.
    PeerStatusChanged(PeerRecord),
}

struct Running {
    cancel: CancellationToken,
    socket: Arc<UdpSocket>,
    handles: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// State shared with the receive, broadcast and sweep tasks.
struct Shared {
    local_id: String,
    presence: RwLock<Presence>,
    table: RwLock<PeerTable>,
    events: broadcast::Sender<DiscoveryEvent>,
    node_timeout: Duration,
}

/// Advertises local presence over UDP and maintains the table of peers
/// heard from recently.
///
/// Presence goes to the broadcast address (when enabled) and every seed on
/// a fixed interval. Known peers also get a unicast heartbeat several times
/// per heartbeat timeout, so one lost datagram never looks like silence to
/// the partition detector. A separate sweep removes peers silent for longer
/// than the node timeout.
pub struct DiscoveryService {
    config: NodeConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
}

impl DiscoveryService {
    pub fn new(config: NodeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let presence = Presence {
            capabilities: config.capabilities.clone(),
            status: PeerStatus::Available,
            role: config.role,
            metadata: config.metadata.clone(),
            election_port: (config.election_port != 0).then_some(config.election_port),
            address: None,
        };
        let shared = Shared {
            local_id: config.node_id.clone(),
            presence: RwLock::new(presence),
            table: RwLock::new(PeerTable::new(config.node_id.clone())),
            events,
            node_timeout: config.node_timeout(),
        };

        Self {
            config,
            shared: Arc::new(shared),
            running: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    /// Bind the discovery socket and start the receive, broadcast, heartbeat
    /// and sweep tasks, then ask the targets to introduce themselves.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CoordError::AlreadyStarted("discovery service"));
        }

        let socket = bind_socket(
            self.config.discovery_addr(),
            Duration::from_millis(self.config.bind_timeout_ms),
        )
        .await?;
        if self.config.broadcast_enabled {
            socket.set_broadcast(true)?;
        }
        let local_addr = socket.local_addr()?;
        self.shared.presence.write().await.address = Some(local_addr.to_string());

        let socket = Arc::new(socket);
        let cancel = self.shutdown.child_token();
        let targets = self.targets();

        let handles = vec![
            tokio::spawn(receive_loop(
                self.shared.clone(),
                socket.clone(),
                cancel.clone(),
            )),
            tokio::spawn(broadcast_loop(
                self.shared.clone(),
                socket.clone(),
                targets.clone(),
                Duration::from_millis(self.config.broadcast_interval_ms),
                cancel.clone(),
            )),
            tokio::spawn(heartbeat_loop(
                self.shared.clone(),
                socket.clone(),
                self.config.peer_heartbeat_interval(),
                cancel.clone(),
            )),
            tokio::spawn(sweep_loop(
                self.shared.clone(),
                Duration::from_millis(self.config.sweep_interval_ms),
                cancel.clone(),
            )),
        ];

        let discovery = Envelope::new(self.shared.local_id.clone(), Payload::NodeDiscovery);
        for target in &targets {
            if let Err(e) = send_envelope(&socket, &discovery, *target).await {
                tracing::warn!(%target, error = %e, "Failed to send discovery request");
            }
        }

        tracing::info!(
            node_id = %self.shared.local_id,
            addr = %local_addr,
            targets = targets.len(),
            "Discovery service started"
        );
        *running = Some(Running {
            cancel,
            socket,
            handles,
            local_addr,
        });
        Ok(())
    }

    /// Announce departure, cancel all tasks and release the socket.
    /// A no-op when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(Running {
            cancel,
            socket,
            handles,
            ..
        }) = running
        else {
            return;
        };

        let leave = Envelope::new(
            self.shared.local_id.clone(),
            Payload::NodeLeave {
                reason: "shutdown".to_string(),
            },
        );
        let mut targets: BTreeSet<SocketAddr> = self.targets().into_iter().collect();
        targets.extend(self.shared.table.read().await.snapshot().iter().map(|p| p.addr()));
        for target in targets {
            if let Err(e) = send_envelope(&socket, &leave, target).await {
                tracing::debug!(%target, error = %e, "Failed to send leave notice");
            }
        }

        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        drop(socket);
        tracing::info!(node_id = %self.shared.local_id, "Discovery service stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Process one inbound datagram received from `sender`.
    ///
    /// Returns the reply to send back, if any. Malformed datagrams, our own
    /// messages and election traffic leave the table untouched.
    pub async fn handle_inbound_message(&self, raw: &[u8], sender: SocketAddr) -> Option<Envelope> {
        self.shared.handle_inbound(raw, sender).await
    }

    /// Snapshot of the peer table, ordered by peer id.
    pub async fn get_peers(&self) -> Vec<PeerRecord> {
        self.shared.table.read().await.snapshot()
    }

    pub async fn get_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.shared.table.read().await.get(peer_id)
    }

    /// Remove peers silent for longer than the node timeout now, outside
    /// the periodic sweep. Returns the removed ids.
    pub async fn expire_stale_peers(&self) -> Vec<String> {
        self.shared.expire(Instant::now()).await
    }

    /// Flag a known peer as unreachable (or clear the flag) in the local
    /// table. Returns whether the record changed.
    pub async fn set_peer_unreachable(&self, peer_id: &str, unreachable: bool) -> bool {
        let changed = self.shared.table.write().await.set_unreachable(peer_id, unreachable);
        match changed {
            Some(record) => {
                tracing::debug!(peer_id, status = %record.status, "Peer reachability changed");
                let _ = self.shared.events.send(DiscoveryEvent::PeerStatusChanged(record));
                true
            }
            None => false,
        }
    }

    pub async fn presence(&self) -> Presence {
        self.shared.presence.read().await.clone()
    }

    pub async fn update_status(&self, status: PeerStatus) {
        self.shared.presence.write().await.status = status;
        self.announce().await;
    }

    pub async fn update_capabilities(&self, capabilities: BTreeSet<String>) {
        self.shared.presence.write().await.capabilities = capabilities;
        self.announce().await;
    }

    pub async fn update_metadata(&self, metadata: BTreeMap<String, String>) {
        self.shared.presence.write().await.metadata = metadata;
        self.announce().await;
    }

    /// Advertise the port our election node listens on.
    pub async fn advertise_election_port(&self, port: u16) {
        self.shared.presence.write().await.election_port = Some(port);
        self.announce().await;
    }

    /// Send the current presence to all targets immediately, if running.
    async fn announce(&self) {
        let socket = match self.running.lock().await.as_ref() {
            Some(running) => running.socket.clone(),
            None => return,
        };
        self.shared.broadcast_presence(&socket, &self.targets()).await;
    }

    fn targets(&self) -> Vec<SocketAddr> {
        let mut targets = BTreeSet::new();
        if self.config.broadcast_enabled {
            targets.insert(self.config.broadcast_target());
        }
        targets.extend(self.config.seeds.iter().copied());
        targets.into_iter().collect()
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    async fn handle_inbound(&self, raw: &[u8], sender: SocketAddr) -> Option<Envelope> {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%sender, error = %e, "Dropping malformed datagram");
                return None;
            }
        };
        if envelope.node_id == self.local_id {
            tracing::trace!("Ignoring own broadcast");
            return None;
        }

        let now = Instant::now();
        match envelope.payload {
            Payload::PresenceBroadcast(presence) | Payload::NodeResponse(presence) => {
                let mut table = self.table.write().await;
                match table.upsert_presence(
                    &envelope.node_id,
                    &presence,
                    sender,
                    envelope.timestamp,
                    now,
                ) {
                    Some(Upsert::Discovered(record)) => {
                        tracing::info!(
                            peer_id = %record.peer_id,
                            addr = %record.addr(),
                            role = %record.role,
                            "Discovered peer"
                        );
                        let _ = self.events.send(DiscoveryEvent::PeerDiscovered(record));
                    }
                    Some(Upsert::Updated(record)) => {
                        tracing::trace!(peer_id = %record.peer_id, "Refreshed peer");
                        let _ = self.events.send(DiscoveryEvent::PeerUpdated(record));
                    }
                    None => {}
                }
                None
            }
            Payload::NodeDiscovery => {
                tracing::debug!(peer_id = %envelope.node_id, %sender, "Answering discovery request");
                let presence = self.presence.read().await.clone();
                Some(Envelope::new(
                    self.local_id.clone(),
                    Payload::NodeResponse(presence),
                ))
            }
            Payload::Heartbeat => {
                let mut table = self.table.write().await;
                if let Some(record) = table.touch(&envelope.node_id, sender, now) {
                    let _ = self.events.send(DiscoveryEvent::PeerUpdated(record));
                }
                None
            }
            Payload::NodeLeave { reason } => {
                let mut table = self.table.write().await;
                if table.remove(&envelope.node_id).is_some() {
                    tracing::info!(peer_id = %envelope.node_id, %reason, "Peer left");
                    let _ = self
                        .events
                        .send(DiscoveryEvent::PeerLeft(envelope.node_id.clone()));
                }
                None
            }
            other => {
                tracing::debug!(%sender, kind = other.kind(), "Ignoring election message on discovery port");
                None
            }
        }
    }

    async fn expire(&self, now: Instant) -> Vec<String> {
        let mut table = self.table.write().await;
        let expired = table.expire(now, self.node_timeout);
        for record in &expired {
            tracing::info!(
                peer_id = %record.peer_id,
                last_seen_at = %record.last_seen_at,
                "Peer expired"
            );
            let _ = self
                .events
                .send(DiscoveryEvent::PeerExpired(record.peer_id.clone()));
        }
        expired.into_iter().map(|r| r.peer_id).collect()
    }

    /// Unicast a bare heartbeat to every peer in the table.
    async fn send_heartbeats(&self, socket: &UdpSocket) {
        let targets: Vec<SocketAddr> = self
            .table
            .read()
            .await
            .snapshot()
            .iter()
            .map(|p| p.addr())
            .collect();
        if targets.is_empty() {
            return;
        }
        let envelope = Envelope::new(self.local_id.clone(), Payload::Heartbeat);
        for target in targets {
            if let Err(e) = send_envelope(socket, &envelope, target).await {
                tracing::debug!(%target, error = %e, "Failed to send heartbeat");
            }
        }
    }

    async fn broadcast_presence(&self, socket: &UdpSocket, targets: &[SocketAddr]) {
        let presence = self.presence.read().await.clone();
        let envelope = Envelope::new(self.local_id.clone(), Payload::PresenceBroadcast(presence));
        for target in targets {
            if let Err(e) = send_envelope(socket, &envelope, *target).await {
                // Retried on the next tick
                tracing::warn!(%target, error = %e, "Failed to send presence broadcast");
            }
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, sender)) => {
                    if let Some(reply) = shared.handle_inbound(&buf[..len], sender).await {
                        if let Err(e) = send_envelope(&socket, &reply, sender).await {
                            tracing::warn!(%sender, error = %e, "Failed to send discovery reply");
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Discovery socket receive failed");
                }
            }
        }
    }
}

async fn broadcast_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    targets: Vec<SocketAddr>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => shared.broadcast_presence(&socket, &targets).await,
        }
    }
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => shared.send_heartbeats(&socket).await,
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>, period: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                shared.expire(Instant::now()).await;
            }
        }
    }
}
