use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::detector::tracker::{DetectorEvent, PartitionDetector, PartitionStatus};
use crate::error::{CoordError, Result};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs [`PartitionDetector::check_for_partitions`] on a fixed period and
/// serializes heartbeat recording against it.
pub struct PartitionMonitor {
    detector: Arc<Mutex<PartitionDetector>>,
    events: broadcast::Sender<DetectorEvent>,
    check_interval: Duration,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
}

impl PartitionMonitor {
    pub fn new(detector: PartitionDetector, check_interval: Duration) -> Self {
        Self {
            events: detector.event_sender(),
            detector: Arc::new(Mutex::new(detector)),
            check_interval,
            running: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a monitor tracking the configured election peers.
    pub fn from_config(config: &NodeConfig) -> Self {
        let detector = PartitionDetector::new(
            config.node_id.clone(),
            config.peers.iter().map(|p| p.node_id.clone()),
            config.heartbeat_timeout(),
            config.partition_detection_threshold,
            Instant::now(),
        );
        Self::new(detector, config.partition_check_interval())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    /// Begin the periodic partition check.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CoordError::AlreadyStarted("partition monitor"));
        }

        let cancel = self.shutdown.child_token();
        let detector = self.detector.clone();
        let period = self.check_interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        detector.lock().await.check_for_partitions(Instant::now());
                    }
                }
            }
            tracing::debug!("Partition monitor stopped");
        });

        tracing::info!(
            check_interval_ms = period.as_millis() as u64,
            "Partition monitor started"
        );
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Cancel the periodic check. A no-op when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn record_heartbeat(&self, peer_id: &str) {
        self.detector
            .lock()
            .await
            .record_heartbeat(peer_id, Instant::now());
    }

    pub async fn track_peer(&self, peer_id: &str) {
        self.detector.lock().await.track_peer(peer_id, Instant::now());
    }

    pub async fn untrack_peer(&self, peer_id: &str) {
        self.detector
            .lock()
            .await
            .untrack_peer(peer_id, Instant::now());
    }

    pub async fn handle_node_rejoin(&self, peer_id: &str) {
        self.detector
            .lock()
            .await
            .handle_node_rejoin(peer_id, Instant::now());
    }

    /// Run one sweep immediately, outside the periodic schedule.
    pub async fn check_now(&self) {
        self.detector
            .lock()
            .await
            .check_for_partitions(Instant::now());
    }

    pub async fn is_unreachable(&self, peer_id: &str) -> bool {
        self.detector.lock().await.is_unreachable(peer_id)
    }

    pub async fn get_partition_status(&self) -> PartitionStatus {
        self.detector.lock().await.status()
    }
}

impl Drop for PartitionMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
