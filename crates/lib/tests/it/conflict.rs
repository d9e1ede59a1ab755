//! Resolver and merger scenarios between two devices.

use std::sync::Arc;

use lansync::{
    FixedClock, PeerId,
    conflict::{ConflictResolver, ConflictType, MergeKind, ResolutionStrategy, ThreeWayMerger, Winner},
    record::{Record, Syncable, Task},
};

use crate::helpers::at;

fn resolver(local: &str) -> ConflictResolver {
    ConflictResolver::new(
        PeerId::from(local),
        ResolutionStrategy::LastWriteWins,
        Arc::new(FixedClock::at(at(12, 0, 0))),
    )
}

fn merger(local: &str) -> ThreeWayMerger {
    ThreeWayMerger::new(resolver(local))
}

/// v1 written by A at 10:00 and acknowledged by both sides.
fn shared_base() -> Task {
    let task = Task::new("t1", "Quarterly report", &PeerId::from("A"), at(10, 0, 0));
    task.with_metadata(task.metadata.acknowledged())
}

fn edited(task: &Task, by: &str, h: u32, m: u32, title: &str) -> Task {
    let mut next = task.with_metadata(task.metadata.touched(&PeerId::from(by), at(h, m, 0)));
    next.title = title.to_string();
    next
}

#[test]
fn scenario_a_identical_replicas_do_not_conflict() {
    let local = Task::new("t1", "Report", &PeerId::from("A"), at(10, 0, 0));
    let remote = local.clone();

    let resolution = resolver("A").resolve(Some(&local), Some(&remote)).unwrap();
    assert_eq!(resolution.conflict_type, ConflictType::NoConflict);
    assert_eq!(resolution.resolved, local);
    assert!(!resolution.changes_local());
}

#[test]
fn scenario_b_concurrent_edits_last_write_wins() {
    let local = edited(&shared_base(), "A", 10, 5, "local title");
    let remote = edited(&shared_base(), "B", 10, 2, "remote title");
    assert_eq!(local.metadata.base_version, Some(1));
    assert_eq!(remote.metadata.base_version, Some(1));

    let result = merger("A").merge(Some(&local), &remote);
    assert_eq!(result.kind, MergeKind::Resolved);
    assert_eq!(result.conflict_type(), ConflictType::UpdateUpdate);
    assert_eq!(result.resolution.winner, Winner::Local);
    assert_eq!(result.record().title, "local title");
    assert_eq!(result.record().metadata.version, 3);
}

#[test]
fn scenario_c_delete_beats_edit_regardless_of_version() {
    let base = Task::new("t1", "Report", &PeerId::from("A"), at(10, 0, 0));
    let v2 = base.with_metadata(base.metadata.touched(&PeerId::from("A"), at(10, 1, 0)));
    let local = v2.with_metadata(v2.metadata.tombstoned(&PeerId::from("A"), at(10, 2, 0)));
    let remote = edited(&base, "B", 10, 3, "still alive");
    assert_eq!(local.metadata.version, 3);
    assert_eq!(remote.metadata.version, 2);

    let resolution = resolver("A").resolve(Some(&local), Some(&remote)).unwrap();
    assert_eq!(resolution.conflict_type, ConflictType::UpdateDelete);
    assert!(resolution.resolved.metadata.is_deleted);

    // The other device reaches the same tombstone
    let mirrored = resolver("B").resolve(Some(&remote), Some(&local)).unwrap();
    assert_eq!(mirrored.conflict_type, ConflictType::UpdateDelete);
    assert!(mirrored.resolved.metadata.is_deleted);
}

#[test]
fn merging_the_same_remote_twice_is_idempotent() {
    let merger = merger("A");
    let local = edited(&shared_base(), "A", 10, 5, "local");
    let remote = edited(&shared_base(), "B", 10, 2, "remote");

    let first = merger.merge(Some(&local), &remote).into_record();
    let second = merger.merge(Some(&first), &remote);
    assert!(!second.changes_local());
    assert_eq!(second.record(), &first);
}

#[test]
fn sequential_updates_resolve_the_same_on_both_sides() {
    let v1 = shared_base();
    let v2 = edited(&v1, "B", 10, 30, "second draft");

    let on_a = merger("A").merge(Some(&v1), &v2);
    let on_b = merger("B").merge(Some(&v2), &v1);
    assert_eq!(on_a.conflict_type(), ConflictType::NoConflict);
    assert_eq!(on_b.conflict_type(), ConflictType::NoConflict);
    assert_eq!(on_a.record().title, on_b.record().title);
    assert_eq!(on_a.record().metadata.version, on_b.record().metadata.version);
}

#[test]
fn resolved_conflicts_always_raise_the_version() {
    for (lm, rm) in [(5, 2), (2, 5), (3, 3)] {
        let local = edited(&shared_base(), "A", 10, lm, "local");
        let remote = edited(&shared_base(), "B", 10, rm, "remote");
        let result = merger("A").merge(Some(&local), &remote);
        let max = local.metadata.version.max(remote.metadata.version);
        assert!(result.record().metadata.version > max, "{lm}/{rm}");
    }
}

#[test]
fn untyped_merge_adopts_new_records() {
    let remote = Record::from(edited(&shared_base(), "B", 11, 0, "fresh"));
    let merge = merger("A").merge_record(None, remote.clone(), at(12, 0, 0));
    assert!(merge.changes_local);
    assert_eq!(merge.kind, MergeKind::FastForward);
    assert_eq!(merge.record.id(), remote.id());
}

#[test]
fn highest_version_strategy_prefers_the_longer_history() {
    let resolver = ConflictResolver::new(
        PeerId::from("A"),
        ResolutionStrategy::HighestVersionWins,
        Arc::new(FixedClock::at(at(12, 0, 0))),
    );
    let merger = ThreeWayMerger::new(resolver);
    let local = edited(&shared_base(), "A", 10, 9, "local");
    let once = edited(&shared_base(), "B", 10, 1, "remote");
    let remote = edited(&once, "B", 10, 2, "remote again");

    let result = merger.merge(Some(&local), &remote);
    assert_eq!(result.conflict_type(), ConflictType::UpdateUpdate);
    assert_eq!(result.record().title, "remote again");
}

/// Send each side's record to the other until a round changes nothing.
fn exchange_until_quiet(a: &mut Task, b: &mut Task) -> usize {
    let (on_a, on_b) = (merger("A"), merger("B"));
    for round in 1..=5 {
        let from_b = on_a.merge(Some(a), b);
        let a_changed = from_b.changes_local();
        *a = from_b.into_record();
        let from_a = on_b.merge(Some(b), a);
        let b_changed = from_a.changes_local();
        *b = from_a.into_record();
        if !a_changed && !b_changed {
            return round;
        }
    }
    panic!("replicas kept changing");
}

#[test]
fn concurrent_edits_converge_after_exchange() {
    let mut a = edited(&shared_base(), "A", 10, 2, "A-edit");
    let mut b = edited(&shared_base(), "B", 10, 5, "B-edit");

    exchange_until_quiet(&mut a, &mut b);
    assert_eq!(a, b);
    assert_eq!(a.title, "B-edit");
    assert_eq!(a.metadata.version, 3);
    assert_eq!(a.metadata.base_version, Some(3));
}

#[test]
fn concurrent_edits_converge_from_either_side() {
    // B hears about A's edit first this time
    let mut a = edited(&shared_base(), "A", 10, 2, "A-edit");
    let mut b = edited(&shared_base(), "B", 10, 5, "B-edit");
    let resolved_on_b = merger("B").merge(Some(&b), &a).into_record();
    b = resolved_on_b;

    exchange_until_quiet(&mut a, &mut b);
    assert_eq!(a, b);
    assert_eq!(a.title, "B-edit");
}

#[test]
fn delete_and_edit_converge_on_the_tombstone() {
    let base = shared_base();
    let mut a = base.with_metadata(base.metadata.tombstoned(&PeerId::from("A"), at(10, 1, 0)));
    let mut b = edited(&base, "B", 10, 3, "still alive");

    exchange_until_quiet(&mut a, &mut b);
    assert_eq!(a, b);
    assert!(a.metadata.is_deleted);
}
