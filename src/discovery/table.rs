use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::Utc;
use tokio::time::{Duration, Instant};

use crate::peer::{PeerRecord, PeerStatus};
use crate::protocol::Presence;

/// Change to the table caused by a presence message.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Discovered(PeerRecord),
    Updated(PeerRecord),
}

#[derive(Debug, Clone)]
struct Entry {
    record: PeerRecord,
    seen: Instant,
    /// Sender timestamp of the newest presence applied to `record`.
    last_timestamp: i64,
    /// Status from the newest presence, restored when the local
    /// unreachable flag clears.
    advertised: PeerStatus,
    unreachable: bool,
}

/// Peers heard from recently, keyed (and therefore ordered) by peer id.
///
/// Never contains the local node. Liveness is tracked on the monotonic
/// clock passed in by the caller; `last_seen_at` on the records is the
/// wall-clock equivalent for observers.
#[derive(Debug)]
pub struct PeerTable {
    local_id: String,
    entries: BTreeMap<String, Entry>,
}

impl PeerTable {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create or refresh a peer from its presence. The observed `sender`
    /// address always wins over anything claimed in the payload.
    ///
    /// Presence content older than what is already stored only refreshes
    /// liveness and address.
    pub fn upsert_presence(
        &mut self,
        peer_id: &str,
        presence: &Presence,
        sender: SocketAddr,
        timestamp: i64,
        now: Instant,
    ) -> Option<Upsert> {
        if peer_id == self.local_id {
            return None;
        }

        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                entry.seen = now;
                entry.record.last_seen_at = Utc::now();
                entry.record.host = sender.ip();
                entry.record.port = sender.port();
                if timestamp >= entry.last_timestamp {
                    entry.last_timestamp = timestamp;
                    entry.advertised = presence.status;
                    apply_presence(&mut entry.record, presence);
                    if entry.unreachable {
                        entry.record.status = PeerStatus::Unreachable;
                    }
                }
                Some(Upsert::Updated(entry.record.clone()))
            }
            None => {
                let mut record = PeerRecord {
                    peer_id: peer_id.to_string(),
                    host: sender.ip(),
                    port: sender.port(),
                    role: presence.role,
                    capabilities: Default::default(),
                    metadata: Default::default(),
                    status: presence.status,
                    election_port: None,
                    last_seen_at: Utc::now(),
                };
                apply_presence(&mut record, presence);
                self.entries.insert(
                    peer_id.to_string(),
                    Entry {
                        record: record.clone(),
                        seen: now,
                        last_timestamp: timestamp,
                        advertised: presence.status,
                        unreachable: false,
                    },
                );
                Some(Upsert::Discovered(record))
            }
        }
    }

    /// Refresh liveness of a known peer. Unknown peers are not created,
    /// since a bare heartbeat carries no presence.
    pub fn touch(&mut self, peer_id: &str, sender: SocketAddr, now: Instant) -> Option<PeerRecord> {
        let entry = self.entries.get_mut(peer_id)?;
        entry.seen = now;
        entry.record.last_seen_at = Utc::now();
        entry.record.host = sender.ip();
        entry.record.port = sender.port();
        Some(entry.record.clone())
    }

    /// Set or clear the local unreachable flag on a known peer. While set,
    /// the record reports `PeerStatus::Unreachable` whatever the peer
    /// advertises. Returns the record only when the flag changed.
    pub fn set_unreachable(&mut self, peer_id: &str, unreachable: bool) -> Option<PeerRecord> {
        let entry = self.entries.get_mut(peer_id)?;
        if entry.unreachable == unreachable {
            return None;
        }
        entry.unreachable = unreachable;
        entry.record.status = if unreachable {
            PeerStatus::Unreachable
        } else {
            entry.advertised
        };
        Some(entry.record.clone())
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.entries.remove(peer_id).map(|e| e.record)
    }

    /// Remove every peer silent for longer than `node_timeout`.
    pub fn expire(&mut self, now: Instant, node_timeout: Duration) -> Vec<PeerRecord> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.seen) > node_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| e.record))
            .collect()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.entries.get(peer_id).map(|e| e.record.clone())
    }

    /// Copies of all records, ordered by peer id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.entries.values().map(|e| e.record.clone()).collect()
    }
}

fn apply_presence(record: &mut PeerRecord, presence: &Presence) {
    record.role = presence.role;
    record.status = presence.status;
    record.capabilities = presence.capabilities.clone();
    record.metadata = presence.metadata.clone();
    record.election_port = presence.election_port;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRole;

    fn presence(status: PeerStatus) -> Presence {
        Presence {
            capabilities: ["compute".to_string()].into_iter().collect(),
            status,
            role: PeerRole::Worker,
            metadata: Default::default(),
            election_port: Some(7000),
            address: Some("203.0.113.9:1".to_string()),
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_discover_then_update() {
        let now = Instant::now();
        let mut table = PeerTable::new("self");

        let first = table.upsert_presence(
            "b",
            &presence(PeerStatus::Available),
            addr("10.0.0.2:4000"),
            1,
            now,
        );
        assert!(matches!(first, Some(Upsert::Discovered(_))));

        let second = table.upsert_presence(
            "b",
            &presence(PeerStatus::Busy),
            addr("10.0.0.3:4001"),
            2,
            now,
        );
        match second {
            Some(Upsert::Updated(rec)) => {
                assert_eq!(rec.status, PeerStatus::Busy);
                assert_eq!(rec.addr(), addr("10.0.0.3:4001"));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_observed_address_wins_over_claimed() {
        let mut table = PeerTable::new("self");
        table.upsert_presence(
            "b",
            &presence(PeerStatus::Available),
            addr("10.0.0.2:4000"),
            1,
            Instant::now(),
        );
        let rec = table.get("b").unwrap();
        assert_eq!(rec.addr(), addr("10.0.0.2:4000"));
        assert_eq!(rec.election_addr(), Some(addr("10.0.0.2:7000")));
    }

    #[test]
    fn test_self_is_never_stored() {
        let mut table = PeerTable::new("self");
        let result = table.upsert_presence(
            "self",
            &presence(PeerStatus::Available),
            addr("10.0.0.1:4000"),
            1,
            Instant::now(),
        );
        assert!(result.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_presence_only_refreshes_liveness() {
        let mut table = PeerTable::new("self");
        let now = Instant::now();
        table.upsert_presence("b", &presence(PeerStatus::Busy), addr("10.0.0.2:4000"), 10, now);
        table.upsert_presence(
            "b",
            &presence(PeerStatus::Available),
            addr("10.0.0.2:4000"),
            5,
            now,
        );
        assert_eq!(table.get("b").unwrap().status, PeerStatus::Busy);
    }

    #[test]
    fn test_expire_removes_only_silent_peers() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(120);
        let mut table = PeerTable::new("self");
        table.upsert_presence("b", &presence(PeerStatus::Available), addr("10.0.0.2:1"), 1, t0);
        table.upsert_presence(
            "c",
            &presence(PeerStatus::Available),
            addr("10.0.0.3:1"),
            1,
            t0 + Duration::from_secs(60),
        );

        // Exactly at the timeout nothing expires
        assert!(table.expire(t0 + timeout, timeout).is_empty());

        let expired = table.expire(t0 + timeout + Duration::from_millis(1), timeout);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer_id, "b");
        assert!(table.get("c").is_some());
    }

    #[test]
    fn test_touch_refreshes_known_peer_only() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut table = PeerTable::new("self");
        table.upsert_presence("b", &presence(PeerStatus::Available), addr("10.0.0.2:1"), 1, t0);

        assert!(table.touch("b", addr("10.0.0.2:1"), t0 + Duration::from_secs(8)).is_some());
        assert!(table.touch("zz", addr("10.0.0.9:1"), t0).is_none());

        assert!(table.expire(t0 + Duration::from_secs(15), timeout).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unreachable_flag_overrides_advertised_status() {
        let now = Instant::now();
        let mut table = PeerTable::new("self");
        table.upsert_presence("b", &presence(PeerStatus::Available), addr("10.0.0.2:1"), 1, now);

        let flagged = table.set_unreachable("b", true).unwrap();
        assert_eq!(flagged.status, PeerStatus::Unreachable);
        assert!(table.set_unreachable("b", true).is_none());
        assert!(table.set_unreachable("zz", true).is_none());

        // A newer presence does not clear the flag, but is remembered
        table.upsert_presence("b", &presence(PeerStatus::Busy), addr("10.0.0.2:1"), 2, now);
        assert_eq!(table.get("b").unwrap().status, PeerStatus::Unreachable);

        let cleared = table.set_unreachable("b", false).unwrap();
        assert_eq!(cleared.status, PeerStatus::Busy);
    }

    #[test]
    fn test_snapshot_is_sorted_copy() {
        let now = Instant::now();
        let mut table = PeerTable::new("self");
        for id in ["c", "a", "b"] {
            table.upsert_presence(id, &presence(PeerStatus::Available), addr("10.0.0.2:1"), 1, now);
        }
        let mut snapshot = table.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|r| r.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        snapshot[0].status = PeerStatus::Unreachable;
        assert_eq!(table.get("a").unwrap().status, PeerStatus::Available);
    }
}
