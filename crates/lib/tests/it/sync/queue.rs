use std::sync::Arc;

use lansync::{
    Clock, PeerId, PeerInfo, SyncEngine, SystemClock,
    record::Task,
    storage::{InMemoryStorage, Storage},
    sync::{SyncDirection, error::ErrorKind},
};

use crate::helpers::{TestNode, WAIT, at, connect_pair, test_config, wait_for_storage, wait_until};

/// Retry delays only elapse on a real clock.
fn system_clock_engine(max_retries: u32) -> SyncEngine {
    let mut config = test_config();
    config.sync.max_retries = max_retries;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let local = PeerInfo::new(PeerId::generate(), "retrying", "127.0.0.1", 0, clock.now());
    SyncEngine::new(local, config, Arc::new(InMemoryStorage::new()) as Arc<dyn Storage>, clock)
}

#[tokio::test]
async fn failing_job_is_retried_then_abandoned() {
    let engine = system_clock_engine(2);
    engine.start().await.unwrap();
    let mut errors = engine.events().errors();
    let ghost = PeerId::from("ghost");

    engine.enqueue(&ghost, SyncDirection::Push);

    let final_event = tokio::time::timeout(WAIT, async {
        loop {
            let event = errors.recv().await.unwrap();
            if !event.recoverable {
                return event;
            }
            assert_eq!(event.kind, ErrorKind::DeviceOffline);
        }
    })
    .await
    .expect("job was never abandoned");
    assert_eq!(final_event.peer, Some(ghost.clone()));
    assert_eq!(final_event.kind, ErrorKind::DeviceOffline);

    // Three attempts plus the abandonment
    let history = engine.history();
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|e| !e.success));
    assert!(engine.queued_jobs().is_empty());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn queued_push_runs_in_the_background() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;
    a.storage
        .upsert(Task::new("t1", "Queued", &a.id(), a.clock.now()).into())
        .await
        .unwrap();

    let job = a.engine.enqueue(&b.id(), SyncDirection::Push);
    assert_eq!(job.retry_count, 0);
    wait_for_storage("b received the task", || async { b.storage.len().await == 1 }).await;
    wait_until("history recorded", || a.engine.history().len() == 1).await;
    assert!(a.engine.queued_jobs().is_empty());
}

#[tokio::test]
async fn identical_pending_jobs_are_merged() {
    let node = TestNode::new("a", test_config(), at(10, 0, 0));
    let peer = PeerId::from("b");

    // Not started, so nothing drains the queue
    let first = node.engine.enqueue(&peer, SyncDirection::Pull);
    let second = node.engine.enqueue(&peer, SyncDirection::Pull);
    assert_eq!(first.id, second.id);
    node.engine.enqueue(&peer, SyncDirection::Push);
    assert_eq!(node.engine.queued_jobs().len(), 2);
}
