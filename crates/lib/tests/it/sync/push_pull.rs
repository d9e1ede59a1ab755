use std::time::Duration;

use chrono::{DateTime, Utc};

use lansync::{
    EntityType, PeerId, Record, SyncError,
    record::{Syncable, Task, TaskList},
    storage::Storage,
    sync::{SyncDirection, SyncMode},
};

use crate::helpers::{TestNode, WAIT, at, connect_pair, wait_for_storage};

fn task(id: &str, title: &str, peer: &PeerId, h: u32, m: u32) -> Record {
    Task::new(id, title, peer, at(h, m, 0)).into()
}

#[tokio::test]
async fn push_delivers_records_and_notifies() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    let list: Record = TaskList::new("inbox", "Inbox", &a.id(), at(9, 0, 0)).into();
    a.storage.upsert(list).await.unwrap();
    a.storage.upsert(task("t1", "Write report", &a.id(), 9, 30)).await.unwrap();
    a.storage.upsert(task("t2", "Review PR", &a.id(), 9, 45)).await.unwrap();

    let mut updates = b.engine.events().data_updated();
    let report = a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap();
    assert_eq!(report.records, 3);
    assert_eq!(report.direction, SyncDirection::Push);

    wait_for_storage("b has all records", || async { b.storage.len().await == 3 }).await;
    let stored = b.storage.get(EntityType::Task, "t1").await.unwrap().unwrap();
    let Record::Task(stored) = stored else {
        panic!("expected a task");
    };
    assert_eq!(stored.title, "Write report");
    // The adopted copy acknowledges the pushed state as its base
    assert_eq!(stored.metadata.base_version, Some(1));

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(update.peer, a.id());
        assert_eq!(update.conflicts, 0);
        seen.push(update.data_type);
    }
    // Lists before the tasks that reference them
    assert_eq!(seen, vec![EntityType::TaskList, EntityType::Task]);

    let history = a.engine.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].records, 3);
    assert_eq!(a.engine.success_rate(), 1.0);
}

#[tokio::test]
async fn pull_fetches_every_type() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    b.storage.upsert(task("t1", "From b", &b.id(), 9, 0)).await.unwrap();
    b.storage.upsert(task("t2", "Also from b", &b.id(), 9, 5)).await.unwrap();

    let report = a.engine.pull_from_peer(&b.id(), SyncMode::Full).await.unwrap();
    assert_eq!(report.direction, SyncDirection::Pull);
    assert_eq!(report.records, 2);
    assert_eq!(a.storage.len().await, 2);
    assert!(a.storage.get(EntityType::Task, "t2").await.unwrap().is_some());

    let stats = a.engine.peer_stats(&b.id()).unwrap();
    assert_eq!(stats.successful_syncs, 1);
}

#[tokio::test]
async fn incremental_push_sends_only_changes() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    a.storage.upsert(task("t1", "Old", &a.id(), 10, 0)).await.unwrap();
    let first = a.engine.sync_with_peer(&b.id(), SyncMode::Incremental).await.unwrap();
    assert_eq!(first.records, 1);

    a.clock.advance(Duration::from_secs(60));
    a.storage.upsert(task("t2", "New", &a.id(), 10, 1)).await.unwrap();
    let second = a.engine.sync_with_peer(&b.id(), SyncMode::Incremental).await.unwrap();
    assert_eq!(second.records, 1);

    let full = a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap();
    assert_eq!(full.records, 2);

    wait_for_storage("b has both tasks", || async { b.storage.len().await == 2 }).await;
}

#[tokio::test]
async fn remote_edit_wins_over_stale_copy() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    a.storage.upsert(task("t1", "Draft", &a.id(), 9, 0)).await.unwrap();
    a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap();
    wait_for_storage("b has t1", || async { b.storage.len().await == 1 }).await;

    // b edits its acknowledged copy, a pulls the edit back
    let Some(Record::Task(copy)) = b.storage.get(EntityType::Task, "t1").await.unwrap() else {
        panic!("expected a task");
    };
    let mut edited = copy.clone();
    edited.metadata = copy.metadata.touched(&b.id(), at(9, 30, 0));
    edited.title = "Final".to_string();
    b.storage.upsert(edited.into()).await.unwrap();

    a.engine.pull_from_peer(&b.id(), SyncMode::Full).await.unwrap();
    let Some(Record::Task(merged)) = a.storage.get(EntityType::Task, "t1").await.unwrap() else {
        panic!("expected a task");
    };
    assert_eq!(merged.title, "Final");
    assert_eq!(merged.metadata.version, 2);
}

async fn stored_task(node: &TestNode, id: &str) -> Task {
    match node.storage.get(EntityType::Task, id).await.unwrap() {
        Some(Record::Task(task)) => task,
        other => panic!("expected task {id}, found {other:?}"),
    }
}

fn edit(task: &Task, by: &PeerId, time: DateTime<Utc>, title: &str) -> Record {
    let mut next = task.clone();
    next.metadata = task.metadata.touched(by, time);
    next.title = title.to_string();
    next.into()
}

#[tokio::test]
async fn concurrent_edits_converge_on_both_engines() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    let base = Task::new("t1", "Report", &a.id(), at(9, 0, 0));
    let base = Task {
        metadata: base.metadata.acknowledged(),
        ..base
    };
    a.storage.upsert(edit(&base, &a.id(), at(10, 2, 0), "a-edit")).await.unwrap();
    b.storage.upsert(edit(&base, &b.id(), at(10, 5, 0), "b-edit")).await.unwrap();

    // b pushes first and a resolves; then both sides exchange until quiet
    b.engine.sync_with_peer(&a.id(), SyncMode::Full).await.unwrap();
    wait_for_storage("a resolves the conflict", || async {
        stored_task(&a, "t1").await.metadata.version == 3
    })
    .await;

    a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap();
    wait_for_storage("b adopts the resolution", || async {
        stored_task(&b, "t1").await.metadata.version == 3
    })
    .await;

    // Pulls merge before returning, so a no-op round is observable directly
    a.engine.pull_from_peer(&b.id(), SyncMode::Full).await.unwrap();
    b.engine.pull_from_peer(&a.id(), SyncMode::Full).await.unwrap();

    let on_a = stored_task(&a, "t1").await;
    let on_b = stored_task(&b, "t1").await;
    assert_eq!(on_a, on_b);
    assert_eq!(on_a.title, "b-edit");
    assert_eq!(on_a.metadata.base_version, Some(3));
    assert_eq!(on_a.metadata.last_modified_by, a.id());
}

#[tokio::test]
async fn applying_touches_only_what_changed() {
    let a = TestNode::started("a").await;
    let (b, recording) = TestNode::recorded("b").await;
    connect_pair(&a, &b).await;

    let original = Task::new("t1", "Report", &a.id(), at(9, 0, 0));
    let original = Task {
        metadata: original.metadata.acknowledged(),
        ..original
    };
    a.storage.upsert(original.clone().into()).await.unwrap();

    b.engine.pull_from_peer(&a.id(), SyncMode::Full).await.unwrap();
    assert_eq!(recording.calls("upsert"), vec!["t1"]);
    assert_eq!(stored_task(&b, "t1").await, original);

    // The same snapshot again is skipped on its metadata alone
    recording.clear();
    b.engine.pull_from_peer(&a.id(), SyncMode::Full).await.unwrap();
    assert_eq!(recording.calls("get_replica_metadata"), vec!["t1"]);
    assert!(recording.calls("get").is_empty());
    assert!(recording.calls("upsert").is_empty());

    // A new version with unchanged fields only rewrites the metadata
    recording.clear();
    let bumped = original.with_metadata(original.metadata.touched(&a.id(), at(9, 5, 0)));
    a.storage.upsert(bumped.clone().into()).await.unwrap();
    b.engine.pull_from_peer(&a.id(), SyncMode::Full).await.unwrap();
    assert_eq!(recording.calls("save_replica_metadata"), vec!["t1"]);
    assert!(recording.calls("upsert").is_empty());

    let stored = stored_task(&b, "t1").await;
    assert_eq!(stored.title, "Report");
    assert_eq!(stored.metadata.version, 2);
    assert_eq!(stored.metadata.base_version, Some(2));
    assert_eq!(stored, bumped.with_metadata(bumped.metadata.acknowledged()));
}

#[tokio::test]
async fn held_lock_refuses_sync_without_history() {
    let a = TestNode::started("a").await;
    let b = TestNode::started("b").await;
    connect_pair(&a, &b).await;

    let guard = a.engine.lock().try_acquire(&b.id()).unwrap();
    let err = a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap_err();
    assert!(err.is_in_progress(), "{err}");
    assert!(a.engine.history().is_empty());

    drop(guard);
    a.engine.sync_with_peer(&b.id(), SyncMode::Full).await.unwrap();
    assert_eq!(a.engine.history().len(), 1);
}

#[tokio::test]
async fn sync_with_unconnected_peer_is_offline() {
    let a = TestNode::started("a").await;
    let ghost = PeerId::from("ghost");

    let err = a.engine.sync_with_peer(&ghost, SyncMode::Full).await.unwrap_err();
    assert!(matches!(err, SyncError::DeviceOffline(_)), "{err}");
    let history = a.engine.history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(a.engine.success_rate(), 0.0);
}
