use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::detector::PartitionMonitor;
use crate::election::log::LogEntry;
use crate::election::rpc::{
    handle_append_entries, handle_append_entries_response, handle_request_vote, ReplicationOutcome,
};
use crate::election::state::{ElectionRole, ElectionState, VoteOutcome};
use crate::election::timer::{quorum, random_election_timeout};
use crate::error::{CoordError, Result};
use crate::protocol::{AppendEntriesRequest, Envelope, Payload, VoteRequest, MAX_DATAGRAM_SIZE};
use crate::transport::{bind_socket, send_envelope};

/// Cap on log entries carried by one AppendEntries datagram.
const MAX_ENTRIES_PER_MESSAGE: usize = 64;

/// Message types for the election event loop
#[derive(Debug)]
pub enum ElectionMessage {
    /// Request to append a command to the log
    AppendCommand {
        command: serde_json::Value,
        response_tx: oneshot::Sender<Result<u64>>,
    },
    /// Start an election now (ignored while leader)
    TriggerElection,
    /// The failure detector lost contact with this peer. Starts an election
    /// early if it is the leader we follow.
    LeaderUnreachable(String),
}

/// Role changes observed by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    ElectionStarted { term: u64 },
    /// The local node won the election for `term`.
    LeaderElected { leader_id: String, term: u64 },
    /// The local node learned of another node's leadership.
    LeaderChanged { leader_id: String, term: u64 },
    /// The local node lost leadership.
    SteppedDown { term: u64 },
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<ElectionMessage>>,
    local_addr: SocketAddr,
}

/// State shared between the handle and the event loop task.
struct Core {
    id: String,
    config: NodeConfig,
    state: RwLock<ElectionState>,
    peers: RwLock<BTreeMap<String, SocketAddr>>,
    /// Peers whose traffic is dropped in both directions.
    blocked: RwLock<HashSet<String>>,
    events: broadcast::Sender<ElectionEvent>,
    detector: Option<Arc<PartitionMonitor>>,
}

/// Leader election coordinator for one node.
///
/// One task owns the election socket and drives every transition: inbound
/// RPCs, the randomized election timer, leader heartbeats and messages sent
/// through [`ElectionNode::message_sender`]. All of them mutate the same
/// [`ElectionState`] under one lock, so a term bump and a vote grant never
/// interleave.
pub struct ElectionNode {
    pub id: String,
    core: Arc<Core>,
    message_tx: mpsc::Sender<ElectionMessage>,
    message_rx: Mutex<Option<mpsc::Receiver<ElectionMessage>>>,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
}

impl ElectionNode {
    pub fn new(config: NodeConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`ElectionNode::new`], but every valid message from a peer is
    /// recorded as a heartbeat on `detector`.
    pub fn with_detector(config: NodeConfig, detector: Arc<PartitionMonitor>) -> Self {
        Self::build(config, Some(detector))
    }

    fn build(config: NodeConfig, detector: Option<Arc<PartitionMonitor>>) -> Self {
        let (message_tx, message_rx) = mpsc::channel(100);
        let (events, _) = broadcast::channel(256);
        let peers = config
            .peers
            .iter()
            .filter(|p| p.node_id != config.node_id)
            .map(|p| (p.node_id.clone(), p.addr))
            .collect();

        let core = Core {
            id: config.node_id.clone(),
            state: RwLock::new(ElectionState::new(Instant::now())),
            peers: RwLock::new(peers),
            blocked: RwLock::new(HashSet::new()),
            events,
            detector,
            config,
        };

        Self {
            id: core.id.clone(),
            core: Arc::new(core),
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
            running: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<ElectionMessage> {
        self.message_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.core.events.subscribe()
    }

    /// Bind the election socket and start the event loop.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CoordError::AlreadyStarted("election node"));
        }

        let socket = bind_socket(self.core.config.election_addr(), self.core.bind_timeout()).await?;
        let local_addr = socket.local_addr()?;
        let message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CoordError::Internal("election message channel lost".into()))?;

        {
            let mut state = self.core.state.write().await;
            state.reset_election_timer(Instant::now(), self.core.election_timeout());
        }

        let cancel = self.shutdown.child_token();
        let core = self.core.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { core.run(socket, message_rx, token).await });

        tracing::info!(node_id = %self.id, addr = %local_addr, "Election node started");
        *running = Some(Running {
            cancel,
            handle,
            local_addr,
        });
        Ok(())
    }

    /// Stop the event loop and release the socket. A stopped leader steps
    /// down. A no-op when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(Running { cancel, handle, .. }) = running else {
            return;
        };
        cancel.cancel();
        match handle.await {
            Ok(rx) => *self.message_rx.lock().await = Some(rx),
            Err(e) => tracing::warn!(node_id = %self.id, error = %e, "Election loop ended abnormally"),
        }

        let mut state = self.core.state.write().await;
        let before = Observed::of(&state);
        let term = state.current_term;
        state.become_follower(term);
        self.core.observe(before, &state);
        tracing::info!(node_id = %self.id, term, "Election node stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.core.state.read().await.is_leader()
    }

    /// Get the current leader ID
    pub async fn get_leader(&self) -> Option<String> {
        self.core.state.read().await.known_leader(&self.id)
    }

    pub async fn current_term(&self) -> u64 {
        self.core.state.read().await.current_term
    }

    pub async fn role(&self) -> ElectionRole {
        self.core.state.read().await.role
    }

    pub async fn voted_for(&self) -> Option<String> {
        self.core.state.read().await.voted_for.clone()
    }

    pub async fn commit_index(&self) -> Option<u64> {
        self.core.state.read().await.commit_index
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.core.state.read().await.log.entries().to_vec()
    }

    /// Current election peers, ordered by id.
    pub async fn peers(&self) -> Vec<(String, SocketAddr)> {
        self.core
            .peers
            .read()
            .await
            .iter()
            .map(|(id, addr)| (id.clone(), *addr))
            .collect()
    }

    /// Add or re-address an election peer. Takes effect from the next
    /// election round; a leader starts replicating to it right away.
    pub async fn add_peer(&self, peer_id: &str, addr: SocketAddr) {
        if peer_id == self.id {
            return;
        }
        let previous = self.core.peers.write().await.insert(peer_id.to_string(), addr);
        if previous.is_none() {
            let mut state = self.core.state.write().await;
            if state.is_leader() {
                let next = state.log.len() as u64;
                state.next_index.insert(peer_id.to_string(), next);
                state.match_index.insert(peer_id.to_string(), None);
            }
            tracing::info!(node_id = %self.id, peer_id, %addr, "Added election peer");
        }
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        if self.core.peers.write().await.remove(peer_id).is_some() {
            let mut state = self.core.state.write().await;
            state.next_index.remove(peer_id);
            state.match_index.remove(peer_id);
            state.advance_commit_index();
            tracing::info!(node_id = %self.id, peer_id, "Removed election peer");
        }
    }

    /// Drop all election traffic to and from `peer_id`.
    pub async fn disconnect_peer(&self, peer_id: &str) {
        self.core.blocked.write().await.insert(peer_id.to_string());
    }

    pub async fn reconnect_peer(&self, peer_id: &str) {
        self.core.blocked.write().await.remove(peer_id);
    }

    /// Append a command to the replicated log (leader only).
    pub async fn propose(&self, command: serde_json::Value) -> Result<u64> {
        self.core.propose(command).await
    }

    /// Get entries that have been committed but not yet applied
    pub async fn take_committed_entries(&self) -> Vec<LogEntry> {
        self.core.state.write().await.take_committed()
    }
}

impl Drop for ElectionNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Role and leader before a transition, for event emission.
struct Observed {
    role: ElectionRole,
    leader_id: Option<String>,
}

impl Observed {
    fn of(state: &ElectionState) -> Self {
        Self {
            role: state.role,
            leader_id: state.leader_id.clone(),
        }
    }
}

impl Core {
    fn election_timeout(&self) -> tokio::time::Duration {
        random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        )
    }

    fn bind_timeout(&self) -> tokio::time::Duration {
        tokio::time::Duration::from_millis(self.config.bind_timeout_ms)
    }

    /// Run the election event loop until cancelled, handing the message
    /// receiver back so the node can be restarted.
    async fn run(
        self: Arc<Self>,
        socket: UdpSocket,
        mut message_rx: mpsc::Receiver<ElectionMessage>,
        token: CancellationToken,
    ) -> mpsc::Receiver<ElectionMessage> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let (is_leader, deadline) = {
                let state = self.state.read().await;
                (state.is_leader(), state.election_deadline)
            };

            tokio::select! {
                _ = token.cancelled() => break,

                // Handle incoming messages
                Some(msg) = message_rx.recv() => {
                    match msg {
                        ElectionMessage::AppendCommand { command, response_tx } => {
                            let result = self.propose(command).await;
                            let _ = response_tx.send(result);
                        }
                        ElectionMessage::TriggerElection => {
                            self.start_election(&socket).await;
                        }
                        ElectionMessage::LeaderUnreachable(peer_id) => {
                            let follows = {
                                let state = self.state.read().await;
                                !state.is_leader() && state.leader_id.as_deref() == Some(peer_id.as_str())
                            };
                            if follows {
                                tracing::info!(node_id = %self.id, leader = %peer_id, "Leader unreachable, starting election early");
                                self.start_election(&socket).await;
                            }
                        }
                    }
                }

                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&socket, &buf[..len], from).await,
                        Err(e) => tracing::debug!(node_id = %self.id, error = %e, "Election socket receive failed"),
                    }
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep_until(deadline), if !is_leader => {
                    let elapsed = self.state.read().await.election_deadline <= Instant::now();
                    if elapsed {
                        tracing::info!(node_id = %self.id, "Election timeout, starting election");
                        self.start_election(&socket).await;
                    }
                }

                // Heartbeat interval (for leaders)
                _ = heartbeat.tick(), if is_leader => {
                    self.send_heartbeats(&socket).await;
                }
            }
        }

        tracing::debug!(node_id = %self.id, "Election loop stopped");
        message_rx
    }

    async fn propose(&self, command: serde_json::Value) -> Result<u64> {
        let mut state = self.state.write().await;
        if !state.is_leader() {
            return Err(CoordError::NotLeader(state.leader_id.clone()));
        }
        let index = state.append_entry(command);
        tracing::debug!(node_id = %self.id, index, term = state.current_term, "Appended command to log");
        Ok(index)
    }

    /// Emit the events implied by a transition from `before` to `state`.
    /// Called with the state lock held.
    fn observe(&self, before: Observed, state: &ElectionState) {
        let term = state.current_term;
        if before.role == ElectionRole::Leader && state.role != ElectionRole::Leader {
            tracing::info!(node_id = %self.id, term, "Stepped down");
            let _ = self.events.send(ElectionEvent::SteppedDown { term });
        }
        if state.role != ElectionRole::Leader && state.leader_id != before.leader_id {
            if let Some(leader_id) = &state.leader_id {
                tracing::info!(node_id = %self.id, leader = %leader_id, term, "Following new leader");
                let _ = self.events.send(ElectionEvent::LeaderChanged {
                    leader_id: leader_id.clone(),
                    term,
                });
            }
        }
    }

    async fn send(&self, socket: &UdpSocket, payload: Payload, target: SocketAddr) {
        let kind = payload.kind();
        let envelope = Envelope::new(self.id.clone(), payload);
        if let Err(e) = send_envelope(socket, &envelope, target).await {
            tracing::warn!(node_id = %self.id, %target, kind, error = %e, "Failed to send election message");
        }
    }

    /// Peers that are currently reachable by the fault-injection filter.
    async fn reachable_peers(&self) -> Vec<(String, SocketAddr)> {
        let blocked = self.blocked.read().await;
        self.peers
            .read()
            .await
            .iter()
            .filter(|(id, _)| !blocked.contains(*id))
            .map(|(id, addr)| (id.clone(), *addr))
            .collect()
    }

    /// Start a new election
    async fn start_election(&self, socket: &UdpSocket) {
        let peer_ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        let needed = quorum(peer_ids.len() + 1);

        let (req, won) = {
            let mut state = self.state.write().await;
            if state.is_leader() {
                return;
            }
            let before = Observed::of(&state);
            let now = Instant::now();
            state.become_candidate(&self.id, needed, now, self.config.request_vote_timeout());
            state.reset_election_timer(now, self.election_timeout());
            let term = state.current_term;
            tracing::info!(node_id = %self.id, term, needed, "Starting election");
            let _ = self.events.send(ElectionEvent::ElectionStarted { term });

            // A single-node cluster wins on its own vote
            let won = state.votes.len() >= state.quorum;
            if won {
                self.become_leader(&mut state, &peer_ids);
            }
            self.observe(before, &state);

            let req = VoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index: state.log.last_index(),
                last_log_term: state.log.last_term(),
            };
            (req, won)
        };

        if won {
            self.send_heartbeats(socket).await;
            return;
        }

        // Request votes from all peers
        for (peer_id, addr) in self.reachable_peers().await {
            tracing::trace!(node_id = %self.id, peer_id = %peer_id, term = req.term, "Requesting vote");
            self.send(socket, Payload::RequestVote(req.clone()), addr).await;
        }
    }

    fn become_leader(&self, state: &mut ElectionState, peer_ids: &[String]) {
        state.become_leader(&self.id, peer_ids);
        let term = state.current_term;
        tracing::info!(node_id = %self.id, term, "Became leader");
        let _ = self.events.send(ElectionEvent::LeaderElected {
            leader_id: self.id.clone(),
            term,
        });
    }

    async fn handle_datagram(&self, socket: &UdpSocket, raw: &[u8], from: SocketAddr) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(node_id = %self.id, %from, error = %e, "Dropping malformed datagram");
                return;
            }
        };
        let sender = envelope.node_id;
        if sender == self.id || self.blocked.read().await.contains(&sender) {
            return;
        }
        if !envelope.payload.is_election() {
            tracing::debug!(node_id = %self.id, %from, kind = envelope.payload.kind(), "Ignoring non-election message");
            return;
        }
        if let Some(detector) = &self.detector {
            detector.record_heartbeat(&sender).await;
        }

        match envelope.payload {
            Payload::RequestVote(req) => {
                let resp = {
                    let mut state = self.state.write().await;
                    let before = Observed::of(&state);
                    let resp = handle_request_vote(&mut state, &req, &self.id);
                    if req.term == state.current_term {
                        state.reset_election_timer(Instant::now(), self.election_timeout());
                    }
                    self.observe(before, &state);
                    resp
                };
                self.send(socket, Payload::VoteResponse(resp), from).await;
            }

            Payload::VoteResponse(resp) => {
                let won = {
                    let mut state = self.state.write().await;
                    let before = Observed::of(&state);
                    let outcome = state.record_vote(&sender, &resp, Instant::now());
                    match outcome {
                        VoteOutcome::Counted(votes) => {
                            tracing::debug!(node_id = %self.id, voter = %sender, votes, needed = state.quorum, "Received vote");
                        }
                        VoteOutcome::Denied => {
                            tracing::debug!(node_id = %self.id, voter = %sender, term = resp.term, "Vote denied");
                        }
                        VoteOutcome::SteppedDown => {
                            state.reset_election_timer(Instant::now(), self.election_timeout());
                        }
                        VoteOutcome::Won => {
                            let peer_ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
                            self.become_leader(&mut state, &peer_ids);
                        }
                        VoteOutcome::Ignored => {}
                    }
                    self.observe(before, &state);
                    outcome == VoteOutcome::Won
                };
                if won {
                    self.send_heartbeats(socket).await;
                }
            }

            Payload::AppendEntries(req) => {
                let resp = {
                    let mut state = self.state.write().await;
                    let before = Observed::of(&state);
                    let resp = handle_append_entries(&mut state, &req, &self.id);
                    if req.term == state.current_term && !state.is_leader() {
                        state.reset_election_timer(Instant::now(), self.election_timeout());
                    }
                    self.observe(before, &state);
                    resp
                };
                tracing::trace!(node_id = %self.id, leader = %req.leader_id, term = req.term, success = resp.success, "AppendEntries handled");
                self.send(socket, Payload::AppendEntriesResponse(resp), from).await;
            }

            Payload::AppendEntriesResponse(resp) => {
                let mut state = self.state.write().await;
                let before = Observed::of(&state);
                let outcome = handle_append_entries_response(&mut state, &sender, &resp);
                if outcome == ReplicationOutcome::SteppedDown {
                    state.reset_election_timer(Instant::now(), self.election_timeout());
                }
                self.observe(before, &state);
            }

            _ => {}
        }
    }

    /// Send AppendEntries to all followers (leader only)
    async fn send_heartbeats(&self, socket: &UdpSocket) {
        let targets = self.reachable_peers().await;
        let requests: Vec<(SocketAddr, AppendEntriesRequest)> = {
            let state = self.state.read().await;
            if !state.is_leader() {
                return;
            }
            targets
                .into_iter()
                .map(|(peer_id, addr)| {
                    let next = state
                        .next_index
                        .get(&peer_id)
                        .copied()
                        .unwrap_or(state.log.len() as u64);
                    let prev_log_index = next.checked_sub(1);
                    let prev_log_term = prev_log_index
                        .and_then(|i| state.log.term_at(i))
                        .unwrap_or(0);
                    let req = AppendEntriesRequest {
                        term: state.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries: state.log.entries_from(next, MAX_ENTRIES_PER_MESSAGE),
                        leader_commit: state.commit_index,
                    };
                    (addr, req)
                })
                .collect()
        };

        for (addr, req) in requests {
            self.send(socket, Payload::AppendEntries(req), addr).await;
        }
    }
}
