//! Two WebSocket transports talking over loopback.

use std::sync::Arc;
use std::time::Duration;

use lansync::{
    Clock, FixedClock, PeerId, PeerInfo, SyncError,
    config::TransportConfig,
    protocol::{DataRequest, Envelope, ErrorMessage, Message},
    record::EntityType,
    transport::{SyncTransport, TransportEvent, WebSocketTransport},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::helpers::{WAIT, at, test_config};

struct Endpoint {
    transport: WebSocketTransport,
    events: mpsc::Receiver<TransportEvent>,
    clock: Arc<FixedClock>,
}

impl Endpoint {
    async fn started(name: &str) -> (Self, u16) {
        Self::started_with(name, test_config().transport).await
    }

    async fn started_with(name: &str, config: TransportConfig) -> (Self, u16) {
        let clock = Arc::new(FixedClock::at(at(10, 0, 0)));
        let local = PeerInfo::new(PeerId::from(name), name, "127.0.0.1", 0, clock.now());
        let (transport, events) = WebSocketTransport::new(
            local,
            config,
            clock.clone() as Arc<dyn Clock>,
            CancellationToken::new(),
        );
        let addr = transport.start_server().await.unwrap();
        (
            Self {
                transport,
                events,
                clock,
            },
            addr.port(),
        )
    }

    fn id(&self) -> PeerId {
        self.transport.local_info().peer_id
    }

    async fn next_event(&mut self) -> TransportEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(self.id(), self.clock.now(), message)
    }
}

#[tokio::test]
async fn handshake_registers_both_sides() {
    let (mut a, _) = Endpoint::started("alpha").await;
    let (mut b, b_port) = Endpoint::started("bravo").await;

    let remote = a.transport.connect("127.0.0.1", b_port).await.unwrap();
    assert_eq!(remote.peer_id, b.id());
    assert_eq!(remote.endpoint(), format!("127.0.0.1:{b_port}"));

    match a.next_event().await {
        TransportEvent::Connected(info) => assert_eq!(info.peer_id, b.id()),
        other => panic!("unexpected event {other:?}"),
    }
    match b.next_event().await {
        TransportEvent::Connected(info) => {
            assert_eq!(info.peer_id, a.id());
            assert_eq!(info.display_name, "alpha");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(a.transport.is_connected(&b.id()));
    assert!(b.transport.is_connected(&a.id()));
    assert_eq!(a.transport.connected_peers().len(), 1);
}

#[tokio::test]
async fn messages_flow_in_both_directions() {
    let (mut a, _) = Endpoint::started("alpha").await;
    let (mut b, b_port) = Endpoint::started("bravo").await;
    a.transport.connect("127.0.0.1", b_port).await.unwrap();
    a.next_event().await;
    b.next_event().await;

    let request = a
        .envelope(Message::DataRequest(DataRequest {
            data_type: EntityType::Task,
            since: None,
        }))
        .with_session("s-1");
    a.transport.send(&b.id(), &request).unwrap();

    let received = match b.next_event().await {
        TransportEvent::Message { peer, envelope } => {
            assert_eq!(peer, a.id());
            envelope
        }
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(received.message, request.message);
    assert_eq!(received.session_id.as_deref(), Some("s-1"));

    let reply = b
        .envelope(Message::Error(ErrorMessage::from(&SyncError::ValidationFailed(
            "nope".into(),
        ))))
        .in_reply_to(received.message_id.clone());
    b.transport.send(&a.id(), &reply).unwrap();

    match a.next_event().await {
        TransportEvent::Message { envelope, .. } => {
            assert_eq!(envelope.reply_to.as_deref(), Some(received.message_id.as_str()));
            assert!(matches!(envelope.message, Message::Error(_)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn sending_to_unknown_peer_fails() {
    let (a, _) = Endpoint::started("alpha").await;
    let envelope = a.envelope(Message::Ping);
    let err = a.transport.send(&PeerId::from("nobody"), &envelope).unwrap_err();
    assert!(matches!(err, SyncError::DeviceNotFound(_)), "{err}");
}

#[tokio::test]
async fn health_and_info_endpoints() {
    let (a, port) = Endpoint::started("alpha").await;
    let base = format!("http://127.0.0.1:{port}");

    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let info: PeerInfo = reqwest::get(format!("{base}/info"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.peer_id, a.id());
    assert_eq!(info.port, port);
}

#[tokio::test]
async fn second_start_reports_already_running() {
    let (a, port) = Endpoint::started("alpha").await;
    let err = a.transport.start_server().await.unwrap_err();
    assert!(matches!(err, SyncError::ServerAlreadyRunning { .. }));
    assert_eq!(
        a.transport.get_server_address().unwrap(),
        format!("127.0.0.1:{port}")
    );

    a.transport.stop_server().unwrap();
    assert!(!a.transport.is_server_running());
}

#[tokio::test]
async fn lost_peer_is_redialed_until_attempts_run_out() {
    let (mut a, _) = Endpoint::started("alpha").await;
    let (mut b, b_port) = Endpoint::started("bravo").await;
    a.transport.connect("127.0.0.1", b_port).await.unwrap();
    a.next_event().await;
    b.next_event().await;

    b.transport.shutdown();

    match a.next_event().await {
        TransportEvent::Disconnected { peer, .. } => assert_eq!(peer, b.id()),
        other => panic!("unexpected event {other:?}"),
    }
    match a.next_event().await {
        TransportEvent::ReconnectGaveUp {
            peer,
            endpoint,
            attempts,
        } => {
            assert_eq!(peer, Some(b.id()));
            assert_eq!(endpoint, format!("127.0.0.1:{b_port}"));
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!a.transport.is_connected(&b.id()));
}

#[tokio::test]
async fn failed_first_dial_is_retried_until_attempts_run_out() {
    let (mut a, _) = Endpoint::started("alpha").await;
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let err = a.transport.connect("127.0.0.1", port).await.unwrap_err();
    assert!(err.is_network_error(), "{err}");
    // A second attempt at the same endpoint shares the running loop
    assert!(a.transport.connect("127.0.0.1", port).await.is_err());

    match a.next_event().await {
        TransportEvent::ReconnectGaveUp {
            peer,
            endpoint,
            attempts,
        } => {
            assert_eq!(peer, None);
            assert_eq!(endpoint, format!("127.0.0.1:{port}"));
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(a.transport.connected_peers().is_empty());
    // Exactly one loop gave up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.events.try_recv().is_err());
}

#[tokio::test]
async fn failed_first_dial_connects_once_the_peer_appears() {
    let mut patient = test_config().transport;
    patient.reconnect.max_attempts = 50;
    let (mut a, _) = Endpoint::started_with("alpha", patient).await;
    let mut config = test_config().transport;
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    assert!(a.transport.connect("127.0.0.1", port).await.is_err());

    config.port = port;
    let (mut b, b_port) = Endpoint::started_with("bravo", config).await;
    assert_eq!(b_port, port);

    match a.next_event().await {
        TransportEvent::Connected(info) => assert_eq!(info.peer_id, b.id()),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(b.next_event().await, TransportEvent::Connected(_)));
}

#[tokio::test]
async fn heartbeats_keep_idle_connections_open() {
    let mut config = test_config().transport;
    config.heartbeat_interval_ms = 50;
    config.dead_after_missed = 2;
    let (mut a, _) = Endpoint::started_with("alpha", config.clone()).await;
    let (mut b, b_port) = Endpoint::started_with("bravo", config).await;
    a.transport.connect("127.0.0.1", b_port).await.unwrap();
    a.next_event().await;
    b.next_event().await;

    // Pongs keep the link alive well past the dead-after window
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.transport.is_connected(&b.id()));
    assert!(b.transport.is_connected(&a.id()));
    assert_eq!(a.transport.prune_dead(), 0);
}
