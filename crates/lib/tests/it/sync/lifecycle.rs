use lansync::{
    SyncError,
    sync::{SyncMode, error::ErrorKind},
};

use crate::helpers::{TestNode, WAIT, connect_pair, wait_until};

#[tokio::test]
async fn start_twice_is_refused() {
    let node = TestNode::started("a").await;
    assert!(node.engine.is_running());
    assert_ne!(node.port(), 0);

    let err = node.engine.start().await.unwrap_err();
    assert!(matches!(err, SyncError::ServerAlreadyRunning { .. }), "{err}");

    node.engine.stop().await.unwrap();
    assert!(!node.engine.is_running());
    assert!(matches!(node.engine.stop().await, Err(SyncError::NotRunning)));
}

#[tokio::test]
async fn stopped_engine_refuses_sync() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    a.engine.stop().await.unwrap();
    assert!(a.engine.connected_peers().is_empty());
    let err = a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap_err();
    assert!(matches!(err, SyncError::NotRunning), "{err}");
    assert!(a.engine.history().is_empty());

    // The other side notices the connection is gone
    let a_id = a.id();
    wait_until("b drops a", || !b.engine.is_connected(&a_id)).await;
}

#[tokio::test]
async fn engine_can_restart_after_stop() {
    let node = TestNode::started("a").await;
    node.engine.stop().await.unwrap();
    node.engine.start().await.unwrap();
    assert!(node.engine.is_running());
    assert!(node.engine.server_address().is_ok());
    node.engine.stop().await.unwrap();
}

#[tokio::test]
async fn health_check_keeps_live_peers() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    assert_eq!(a.engine.request_health_check().await.unwrap(), 0);

    connect_pair(&a, &b).await;
    assert_eq!(a.engine.request_health_check().await.unwrap(), 0);
    assert!(a.engine.is_connected(&b.id()));

    a.engine.stop().await.unwrap();
    assert!(matches!(
        a.engine.request_health_check().await,
        Err(SyncError::NotRunning)
    ));
}

#[tokio::test]
async fn disconnect_forgets_the_peer() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    assert!(a.engine.disconnect(&b.id()));
    assert!(!a.engine.is_connected(&b.id()));
    let a_id = a.id();
    wait_until("b drops a", || !b.engine.is_connected(&a_id)).await;
    assert!(!a.engine.disconnect(&b.id()));
}

#[tokio::test]
async fn unreachable_peer_is_reported_after_retries() {
    let node = TestNode::started("a").await;
    let mut errors = node.engine.events().errors();

    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = node.engine.connect("127.0.0.1", port).await.unwrap_err();
    assert!(err.is_network_error(), "{err}");

    let event = tokio::time::timeout(WAIT, async {
        loop {
            let event = errors.recv().await.unwrap();
            if event.kind == ErrorKind::ConnectionFailed && event.message.contains("attempts") {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.peer, None);
    assert!(event.message.contains(&format!("127.0.0.1:{port}")), "{}", event.message);
    assert!(event.recoverable);
    assert!(node.engine.connected_peers().is_empty());
}
