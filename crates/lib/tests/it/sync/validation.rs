//! Inbound payloads sent by a bare transport standing in for a peer.

use std::sync::Arc;
use std::time::Duration;

use lansync::{
    Clock, EntityType, FixedClock, PeerId, PeerInfo,
    protocol::{DataPayload, EncodedPayload, Envelope, Message, PayloadCodec},
    record::Task,
    storage::Storage,
    sync::error::ErrorKind,
    transport::{SyncTransport, TransportEvent, WebSocketTransport},
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::helpers::{TestNode, WAIT, at, test_config, wait_for_storage, wait_until};

struct RawPeer {
    transport: WebSocketTransport,
    events: mpsc::Receiver<TransportEvent>,
    clock: Arc<FixedClock>,
}

impl RawPeer {
    /// Connect a bare transport to `node` and wait for both sides.
    async fn connected_to(node: &TestNode) -> Self {
        let clock = Arc::new(FixedClock::at(at(10, 0, 0)));
        let local = PeerInfo::new(PeerId::from("raw"), "raw", "127.0.0.1", 0, clock.now());
        let (transport, mut events) = WebSocketTransport::new(
            local,
            test_config().transport,
            clock.clone() as Arc<dyn Clock>,
            CancellationToken::new(),
        );
        transport.connect("127.0.0.1", node.port()).await.unwrap();
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap() {
            Some(TransportEvent::Connected(_)) => {}
            other => panic!("unexpected event {other:?}"),
        }
        let raw = PeerId::from("raw");
        wait_until("node sees raw peer", || node.engine.is_connected(&raw)).await;
        Self {
            transport,
            events,
            clock,
        }
    }

    fn push(&self, node: &TestNode, body: EncodedPayload, session: &str) -> String {
        let envelope = Envelope::new(PeerId::from("raw"), self.clock.now(), Message::DataUpdate(body))
            .with_session(session);
        let id = envelope.message_id.clone();
        self.transport.send(&node.id(), &envelope).unwrap();
        id
    }

    async fn next_message(&mut self) -> Envelope {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("event channel closed");
            if let TransportEvent::Message { envelope, .. } = event {
                return envelope;
            }
        }
    }
}

fn valid_tasks(ids: &[&str]) -> EncodedPayload {
    let peer = PeerId::from("raw");
    let records = ids
        .iter()
        .map(|id| Task::new(*id, format!("Task {id}"), &peer, at(9, 0, 0)).into())
        .collect();
    PayloadCodec::default()
        .encode(&DataPayload::from_records(EntityType::Task, records))
        .unwrap()
}

#[tokio::test]
async fn invalid_payload_is_rejected_with_an_error_reply() {
    let node = TestNode::started("node").await;
    let mut raw = RawPeer::connected_to(&node).await;
    let mut errors = node.engine.events().errors();

    let body = EncodedPayload(json!({
        "dataType": "task",
        "records": [
            { "id": "ok", "title": "Fine", "metadata": {
                "lastModifiedAt": "2024-03-01T09:00:00Z", "lastModifiedBy": "raw", "version": 1 } },
            { "id": "bad", "metadata": {
                "lastModifiedAt": "2024-03-01T09:00:00Z", "lastModifiedBy": "raw", "version": 1 } }
        ]
    }));
    let sent = raw.push(&node, body, "s-1");

    let reply = raw.next_message().await;
    assert_eq!(reply.reply_to.as_deref(), Some(sent.as_str()));
    let Message::Error(error) = reply.message else {
        panic!("expected an error reply, got {:?}", reply.message);
    };
    assert_eq!(error.kind, ErrorKind::ValidationFailed);
    assert!(error.message.contains("records[1].title"), "{}", error.message);

    let event = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, ErrorKind::ValidationFailed);
    assert!(!event.recoverable);
    // Nothing from the rejected batch was written
    assert_eq!(node.storage.len().await, 0);
}

#[tokio::test]
async fn corrupt_compressed_payload_is_dropped_silently() {
    let node = TestNode::started("node").await;
    let mut raw = RawPeer::connected_to(&node).await;

    let corrupt = EncodedPayload(json!({ "compressed": true, "data": "@@not base64@@" }));
    raw.push(&node, corrupt, "s-1");
    raw.push(&node, valid_tasks(&["t1"]), "s-2");

    wait_for_storage("valid batch applied", || async { node.storage.len().await == 1 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        raw.events.try_recv().is_err(),
        "corrupt payload must not be answered"
    );
}

#[tokio::test]
async fn replayed_session_is_applied_once() {
    let node = TestNode::started("node").await;
    let raw = RawPeer::connected_to(&node).await;
    let mut updates = node.engine.events().data_updated();

    raw.push(&node, valid_tasks(&["t1"]), "s-1");
    let first = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(first.ids, vec!["t1".to_string()]);

    // Same session and type again, then a new session with a new record
    raw.push(&node, valid_tasks(&["t1", "t2"]), "s-1");
    raw.push(&node, valid_tasks(&["t3"]), "s-2");
    let next = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(next.ids, vec!["t3".to_string()]);
    assert!(node.storage.get(EntityType::Task, "t2").await.unwrap().is_none());
}
