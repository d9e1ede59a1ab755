use lansync::{
    EntityType, Record,
    record::{RecordKind, TimeLogEntry},
    storage::Storage,
};

use crate::helpers::{TestNode, at, connect_pair, test_config, wait_for_storage, wait_until};

async fn time_log(node: &TestNode, id: &str) -> Option<TimeLogEntry> {
    node.storage
        .get(EntityType::TimeLogEntry, id)
        .await
        .unwrap()
        .and_then(TimeLogEntry::from_record)
}

#[tokio::test]
async fn later_timer_wins_and_closes_the_earlier_one() {
    let a = TestNode::new("a", test_config(), at(10, 0, 0));
    let b = TestNode::new("b", test_config(), at(10, 0, 2));
    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();

    let a_timer = a.engine.start_timer("task-1", "Deep work").await.unwrap();
    let b_timer = b.engine.start_timer("task-1", "Deep work").await.unwrap();
    let a_entry = a_timer.time_log_id.clone().unwrap();
    let b_entry = b_timer.time_log_id.clone().unwrap();

    connect_pair(&a, &b).await;

    wait_for_storage("a's entry closed", || async {
        time_log(&a, &a_entry).await.is_some_and(|e| !e.is_open())
    })
    .await;
    let closed = time_log(&a, &a_entry).await.unwrap();
    assert_eq!(closed.end_time, Some(at(10, 0, 2)));
    assert_eq!(closed.duration_seconds, 2);

    // b keeps timing; a only tracks b's timer now
    assert!(time_log(&b, &b_entry).await.unwrap().is_open());
    let b_id = b.id();
    wait_until("a sees only b's timer", || {
        let timers = a.engine.active_timers();
        timers.len() == 1 && timers[0].peer_id == b_id
    })
    .await;
    assert!(
        b.engine
            .active_timers()
            .iter()
            .any(|t| t.peer_id == b_id && t.entity_id == "task-1")
    );

    // The yielding side pushes its closed entry to the winner
    wait_for_storage("b received a's closed entry", || async {
        time_log(&b, &a_entry).await.is_some_and(|e| e.end_time == Some(at(10, 0, 2)))
    })
    .await;
}

#[tokio::test]
async fn stopping_a_timer_closes_its_entry() {
    let a = TestNode::started("a").await;
    let timer = a.engine.start_timer("task-1", "Email").await.unwrap();
    assert_eq!(a.engine.active_timers().len(), 1);

    a.clock.advance(std::time::Duration::from_secs(90));
    let closed = a.engine.stop_timer("task-1").await.unwrap().unwrap();
    assert_eq!(Some(closed.id.clone()), timer.time_log_id);
    assert_eq!(closed.end_time, Some(at(10, 1, 30)));
    assert_eq!(closed.duration_seconds, 90);
    assert_eq!(closed.task_id.as_deref(), Some("task-1"));
    assert!(a.engine.active_timers().is_empty());

    assert!(a.engine.stop_timer("task-1").await.unwrap().is_none());
    let stored = a.storage.get(EntityType::TimeLogEntry, &closed.id).await.unwrap();
    assert!(matches!(stored, Some(Record::TimeLogEntry(e)) if !e.is_open()));
}

#[tokio::test]
async fn remote_stop_clears_the_remote_timer() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    b.engine.start_timer("task-9", "Reading").await.unwrap();
    wait_until("a sees b's timer", || a.engine.active_timers().len() == 1).await;

    b.engine.stop_timer("task-9").await.unwrap();
    wait_until("a forgets b's timer", || a.engine.active_timers().is_empty()).await;
}
