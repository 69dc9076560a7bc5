//! Discovery over real UDP sockets on localhost, using unicast seeds.


use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use aware_lite::discovery::DiscoveryEvent;
use aware_lite::peer::{PeerRole, PeerStatus};
use aware_lite::protocol::{Envelope, Payload, Presence};
use test_harness::{
    assert_eventually, local_addr, start_discovery, test_discovery_config, wait_for,
};
use tokio::net::UdpSocket;

fn presence(address: Option<&str>) -> Presence {
    Presence {
        capabilities: ["compute".to_string()].into_iter().collect(),
        status: PeerStatus::Available,
        role: PeerRole::Worker,
        metadata: BTreeMap::new(),
        election_port: None,
        address: address.map(str::to_string),
    }
}

async fn send_raw(socket: &UdpSocket, envelope: Envelope, port: u16) {
    let bytes = envelope.encode().unwrap();
    socket.send_to(&bytes, local_addr(port)).await.unwrap();
}

#[tokio::test]
async fn test_two_services_discover_each_other() {
    let a = start_discovery(test_discovery_config("a", 44400, &[44401])).await;
    let b = start_discovery(test_discovery_config("b", 44401, &[44400])).await;

    assert_eventually(
        || async { a.get_peer("b").await.is_some() && b.get_peer("a").await.is_some() },
        Duration::from_secs(2),
        "both services should list each other",
    )
    .await;

    let seen_by_a = a.get_peer("b").await.unwrap();
    assert_eq!(seen_by_a.addr(), local_addr(44401));
    assert!(seen_by_a.has_capability("compute"));
    assert_eq!(a.get_peers().await.len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_peer_address_comes_from_datagram_source() {
    let service = start_discovery(test_discovery_config("a", 44410, &[])).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let raw_addr = raw.local_addr().unwrap();

    send_raw(
        &raw,
        Envelope::new("spoofer", Payload::PresenceBroadcast(presence(Some("10.9.9.9:1234")))),
        44410,
    )
    .await;

    assert_eventually(
        || async { service.get_peer("spoofer").await.is_some() },
        Duration::from_secs(1),
        "spoofer should be recorded",
    )
    .await;
    let record = service.get_peer("spoofer").await.unwrap();
    assert_eq!(record.addr(), raw_addr);

    service.stop().await;
}

#[tokio::test]
async fn test_discovery_request_is_answered() {
    let mut config = test_discovery_config("a", 44420, &[]);
    config.metadata.insert("zone".to_string(), "eu".to_string());
    let service = start_discovery(config).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send_raw(&raw, Envelope::new("asker", Payload::NodeDiscovery), 44420).await;

    let mut buf = vec![0u8; 4096];
    let (len, from) = tokio::time::timeout(Duration::from_secs(1), raw.recv_from(&mut buf))
        .await
        .expect("reply should arrive")
        .unwrap();
    assert_eq!(from, local_addr(44420));

    let reply = Envelope::decode(&buf[..len]).unwrap();
    assert_eq!(reply.node_id, "a");
    match reply.payload {
        Payload::NodeResponse(p) => {
            assert_eq!(p.metadata.get("zone").map(String::as_str), Some("eu"));
        }
        other => panic!("expected node_response, got {other:?}"),
    }

    service.stop().await;
}

#[tokio::test]
async fn test_stopped_peer_is_removed_by_leave_notice() {
    let a = start_discovery(test_discovery_config("a", 44430, &[44431])).await;
    let b = start_discovery(test_discovery_config("b", 44431, &[44430])).await;
    assert_eventually(
        || async { a.get_peer("b").await.is_some() },
        Duration::from_secs(2),
        "a should discover b",
    )
    .await;

    let mut events = a.subscribe();
    b.stop().await;

    let left = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(DiscoveryEvent::PeerLeft(id)) => return id,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("leave notice should arrive");
    assert_eq!(left, "b");
    assert!(a.get_peers().await.is_empty());

    a.stop().await;
}

#[tokio::test]
async fn test_silent_peer_expires_while_live_peer_persists() {
    let a = start_discovery(test_discovery_config("a", 44440, &[44441])).await;
    let b = start_discovery(test_discovery_config("b", 44441, &[44440])).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut events = a.subscribe();
    send_raw(
        &raw,
        Envelope::new("ghost", Payload::PresenceBroadcast(presence(None))),
        44440,
    )
    .await;
    assert_eventually(
        || async { a.get_peer("ghost").await.is_some() && a.get_peer("b").await.is_some() },
        Duration::from_secs(2),
        "a should know both peers",
    )
    .await;

    // node_timeout is 1s; the sweep runs every 50ms
    assert!(
        wait_for(
            || async { a.get_peer("ghost").await.is_none() },
            Duration::from_secs(3),
            Duration::from_millis(50),
        )
        .await,
        "silent peer should expire"
    );
    assert!(a.get_peer("b").await.is_some(), "live peer must survive");

    let mut expired = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DiscoveryEvent::PeerExpired(id) = event {
            expired.push(id);
        }
    }
    assert_eq!(expired, vec!["ghost".to_string()]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_own_broadcasts_never_list_self() {
    // Seeding ourselves loops every presence broadcast back to us
    let service = start_discovery(test_discovery_config("a", 44450, &[44450])).await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(service.get_peers().await.is_empty());
    assert!(service.get_peer("a").await.is_none());

    service.stop().await;
}

#[tokio::test]
async fn test_malformed_datagrams_are_ignored() {
    let service = start_discovery(test_discovery_config("a", 44460, &[])).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let garbage: [&[u8]; 4] = [
        b"\x00\x01\x02",
        b"{\"nodeId\":\"x\"}",
        br#"{"type":"presence_broadcast","nodeId":"","timestamp":1,"capabilities":[],"status":"available"}"#,
        br#"{"type":"presence_broadcast","nodeId":"y","timestamp":1,"status":"sleeping","capabilities":[]}"#,
    ];
    for datagram in garbage {
        raw.send_to(datagram, local_addr(44460)).await.unwrap();
    }
    send_raw(
        &raw,
        Envelope::new("valid", Payload::PresenceBroadcast(presence(None))),
        44460,
    )
    .await;

    assert_eventually(
        || async { service.get_peer("valid").await.is_some() },
        Duration::from_secs(1),
        "the valid datagram after the garbage should still be processed",
    )
    .await;
    let ids: Vec<String> = service
        .get_peers()
        .await
        .into_iter()
        .map(|p| p.peer_id)
        .collect();
    assert_eq!(ids, vec!["valid".to_string()]);

    service.stop().await;
}

#[tokio::test]
async fn test_presence_changes_reach_peers() {
    let a = start_discovery(test_discovery_config("a", 44470, &[44471])).await;
    let b = start_discovery(test_discovery_config("b", 44471, &[44470])).await;
    assert_eventually(
        || async { b.get_peer("a").await.is_some() },
        Duration::from_secs(2),
        "b should discover a",
    )
    .await;

    a.update_status(PeerStatus::Busy).await;
    let caps: BTreeSet<String> = ["gpu".to_string()].into_iter().collect();
    a.update_capabilities(caps).await;

    assert_eventually(
        || async {
            b.get_peer("a")
                .await
                .is_some_and(|p| p.status == PeerStatus::Busy && p.has_capability("gpu"))
        },
        Duration::from_secs(2),
        "b should see a's new status and capabilities",
    )
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_second_service_on_same_port_fails_to_start() {
    let first = start_discovery(test_discovery_config("a", 44480, &[])).await;
    let second = aware_lite::discovery::DiscoveryService::new(test_discovery_config("b", 44480, &[]));

    assert!(second.start().await.is_err());
    assert!(second.local_addr().await.is_none());

    first.stop().await;
}
