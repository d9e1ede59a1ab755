//! Discovery over a real UDP socket, fed with hand-made datagrams.

use std::sync::Arc;
use std::time::Duration;

use lansync::{
    Clock, FixedClock, PeerId, PeerInfo,
    config::DiscoveryConfig,
    discovery::{Announcement, Discovery, DiscoveryHandle},
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::helpers::{WAIT, at};

fn listener_config() -> DiscoveryConfig {
    DiscoveryConfig {
        port: 0,
        broadcast_address: "127.0.0.1".to_string(),
        cleanup_interval_ms: 20,
        ..DiscoveryConfig::default()
    }
}

async fn listen(local: &PeerInfo, clock: Arc<FixedClock>) -> DiscoveryHandle {
    Discovery::listen_only(local.clone(), listener_config(), clock as Arc<dyn Clock>)
        .start(CancellationToken::new())
        .await
        .unwrap()
}

async fn send(handle: &DiscoveryHandle, bytes: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", handle.local_addr().port());
    socket.send_to(bytes, target).await.unwrap();
}

async fn wait_for_peers(handle: &DiscoveryHandle, count: usize) -> Vec<PeerInfo> {
    let mut peers = handle.peers();
    let found = tokio::time::timeout(WAIT, peers.wait_for(|p| p.len() == count))
        .await
        .expect("timed out waiting for peer table")
        .unwrap()
        .clone();
    found
}

#[tokio::test]
async fn announcements_populate_the_peer_table() {
    let clock = Arc::new(FixedClock::at(at(10, 0, 0)));
    let local = PeerInfo::new(PeerId::from("listener"), "listener", "", 0, clock.now());
    let handle = listen(&local, clock.clone()).await;

    let remote = PeerInfo::new(PeerId::from("laptop"), "Laptop", "", 8765, clock.now());
    let bytes = Announcement::new(&remote, clock.now()).to_bytes().unwrap();
    send(&handle, &bytes).await;

    let peers = wait_for_peers(&handle, 1).await;
    assert_eq!(peers[0].peer_id, PeerId::from("laptop"));
    assert_eq!(peers[0].display_name, "Laptop");
    // No advertised address, so the datagram source is used
    assert_eq!(peers[0].address, "127.0.0.1");
    assert_eq!(peers[0].port, 8765);

    handle.stop().await;
}

#[tokio::test]
async fn repeated_announcements_refresh_the_entry() {
    let clock = Arc::new(FixedClock::at(at(10, 0, 0)));
    let local = PeerInfo::new(PeerId::from("listener"), "listener", "", 0, clock.now());
    let handle = listen(&local, clock.clone()).await;

    let phone = PeerInfo::new(PeerId::from("phone"), "Phone", "10.0.0.7", 8765, clock.now());
    send(&handle, &Announcement::new(&phone, clock.now()).to_bytes().unwrap()).await;
    wait_for_peers(&handle, 1).await;

    clock.advance(Duration::from_secs(30));
    let moved = PeerInfo::new(PeerId::from("phone"), "Phone", "10.0.0.8", 8765, clock.now());
    send(&handle, &Announcement::new(&moved, clock.now()).to_bytes().unwrap()).await;

    let mut peers = handle.peers();
    let refreshed = tokio::time::timeout(WAIT, peers.wait_for(|p| p.first().is_some_and(|p| p.address == "10.0.0.8")))
        .await
        .expect("timed out waiting for refreshed entry")
        .unwrap()
        .clone();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(refreshed[0].last_seen, clock.now());

    handle.stop().await;
}

#[tokio::test]
async fn silent_peers_are_evicted_after_the_ttl() {
    let clock = Arc::new(FixedClock::at(at(10, 0, 0)));
    let local = PeerInfo::new(PeerId::from("listener"), "listener", "", 0, clock.now());
    let handle = listen(&local, clock.clone()).await;

    let remote = PeerInfo::new(PeerId::from("laptop"), "Laptop", "", 8765, clock.now());
    send(&handle, &Announcement::new(&remote, clock.now()).to_bytes().unwrap()).await;
    wait_for_peers(&handle, 1).await;

    clock.advance(Duration::from_secs(59));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.snapshot().len(), 1);

    clock.advance(Duration::from_secs(2));
    wait_for_peers(&handle, 0).await;

    handle.stop().await;
}
