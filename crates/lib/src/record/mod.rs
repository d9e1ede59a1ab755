//! The replicated data model.
//!
//! Every record kind is plain domain data plus one [`ReplicaMetadata`].
//! Records are value snapshots: merging never mutates an input, it builds a
//! new record through [`Syncable::with_metadata`].

mod metadata;

pub use metadata::ReplicaMetadata;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::peer_types::PeerId;

/// The four replicated record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    TaskList,
    Task,
    TimeLogEntry,
    Goal,
}

impl EntityType {
    /// Push order for a full sync: lists before the tasks that reference
    /// them, tasks before their time logs and goals.
    pub const SYNC_ORDER: [EntityType; 4] = [
        EntityType::TaskList,
        EntityType::Task,
        EntityType::TimeLogEntry,
        EntityType::Goal,
    ];

    /// Wire name, as used in `dataType`.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::TaskList => "taskList",
            EntityType::Task => "task",
            EntityType::TimeLogEntry => "timeLogEntry",
            EntityType::Goal => "goal",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of every replicated record kind.
pub trait Syncable: Clone + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;
    fn metadata(&self) -> &ReplicaMetadata;
    /// A copy of this record carrying `metadata` instead.
    fn with_metadata(&self, metadata: ReplicaMetadata) -> Self;
}

macro_rules! impl_syncable {
    ($ty:ty, $kind:expr) => {
        impl Syncable for $ty {
            const ENTITY_TYPE: EntityType = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn metadata(&self) -> &ReplicaMetadata {
                &self.metadata
            }

            fn with_metadata(&self, metadata: ReplicaMetadata) -> Self {
                Self {
                    metadata,
                    ..self.clone()
                }
            }
        }
    };
}

/// A to-do item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    pub metadata: ReplicaMetadata,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        peer: &PeerId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            notes: None,
            list_id: None,
            completed: false,
            due_at: None,
            priority: 0,
            metadata: ReplicaMetadata::new(peer.clone(), now),
        }
    }
}

impl_syncable!(Task, EntityType::Task);

/// A named group of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub position: i64,
    pub metadata: ReplicaMetadata,
}

impl TaskList {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        peer: &PeerId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: None,
            position: 0,
            metadata: ReplicaMetadata::new(peer.clone(), now),
        }
    }
}

impl_syncable!(TaskList, EntityType::TaskList);

/// A span of tracked time. Open while `end_time` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeLogEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub label: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: u64,
    pub metadata: ReplicaMetadata,
}

impl TimeLogEntry {
    /// An open entry started at `start_time`.
    pub fn start(
        id: impl Into<String>,
        label: impl Into<String>,
        start_time: DateTime<Utc>,
        peer: &PeerId,
    ) -> Self {
        Self {
            id: id.into(),
            task_id: None,
            label: label.into(),
            start_time,
            end_time: None,
            duration_seconds: 0,
            metadata: ReplicaMetadata::new(peer.clone(), start_time),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// A closed copy ending at `end`, mutated by `peer` at `now`.
    ///
    /// An `end` before the start clamps to a zero-length entry.
    pub fn closed_at(&self, end: DateTime<Utc>, peer: &PeerId, now: DateTime<Utc>) -> Self {
        let end = end.max(self.start_time);
        Self {
            end_time: Some(end),
            duration_seconds: (end - self.start_time).num_seconds().max(0) as u64,
            metadata: self.metadata.touched(peer, now),
            ..self.clone()
        }
    }
}

impl_syncable!(TimeLogEntry, EntityType::TimeLogEntry);

/// Goal period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GoalPeriod {
    Daily,
    Weekly,
    Monthly,
}

/// A time target over a period, optionally tied to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub target_minutes: u32,
    pub period: GoalPeriod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub metadata: ReplicaMetadata,
}

impl_syncable!(Goal, EntityType::Goal);

/// Any replicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "record", rename_all = "camelCase")]
pub enum Record {
    TaskList(TaskList),
    Task(Task),
    TimeLogEntry(TimeLogEntry),
    Goal(Goal),
}

impl Record {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Record::TaskList(_) => EntityType::TaskList,
            Record::Task(_) => EntityType::Task,
            Record::TimeLogEntry(_) => EntityType::TimeLogEntry,
            Record::Goal(_) => EntityType::Goal,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::TaskList(r) => r.id(),
            Record::Task(r) => r.id(),
            Record::TimeLogEntry(r) => r.id(),
            Record::Goal(r) => r.id(),
        }
    }

    pub fn metadata(&self) -> &ReplicaMetadata {
        match self {
            Record::TaskList(r) => r.metadata(),
            Record::Task(r) => r.metadata(),
            Record::TimeLogEntry(r) => r.metadata(),
            Record::Goal(r) => r.metadata(),
        }
    }

    pub fn with_metadata(&self, metadata: ReplicaMetadata) -> Self {
        match self {
            Record::TaskList(r) => Record::TaskList(r.with_metadata(metadata)),
            Record::Task(r) => Record::Task(r.with_metadata(metadata)),
            Record::TimeLogEntry(r) => Record::TimeLogEntry(r.with_metadata(metadata)),
            Record::Goal(r) => Record::Goal(r.with_metadata(metadata)),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata().is_deleted
    }

    /// Whether this record changed strictly after `since`.
    pub fn modified_after(&self, since: DateTime<Utc>) -> bool {
        self.metadata().last_modified_at > since
    }
}

/// Typed access to the [`Record`] variant for one kind.
pub trait RecordKind: Syncable {
    fn into_record(self) -> Record;
    fn from_record(record: Record) -> Option<Self>;
}

macro_rules! impl_record_kind {
    ($ty:ident) => {
        impl RecordKind for $ty {
            fn into_record(self) -> Record {
                Record::$ty(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$ty(r) => Some(r),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Record {
            fn from(r: $ty) -> Self {
                Record::$ty(r)
            }
        }
    };
}

impl_record_kind!(TaskList);
impl_record_kind!(Task);
impl_record_kind!(TimeLogEntry);
impl_record_kind!(Goal);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use std::time::Duration;

    #[test]
    fn with_metadata_leaves_input_untouched() {
        let clock = FixedClock::default();
        let peer = PeerId::from("a");
        let task = Task::new("t1", "Write report", &peer, clock.now());
        let touched = task.with_metadata(task.metadata.touched(&peer, clock.now()));
        assert_eq!(task.metadata.version, 1);
        assert_eq!(touched.metadata.version, 2);
        assert_eq!(touched.title, task.title);
    }

    #[test]
    fn closing_an_entry_computes_duration() {
        let clock = FixedClock::default();
        let peer = PeerId::from("a");
        let entry = TimeLogEntry::start("l1", "Focus", clock.now(), &peer);
        assert!(entry.is_open());
        clock.advance(Duration::from_secs(90));
        let closed = entry.closed_at(clock.now(), &peer, clock.now());
        assert!(!closed.is_open());
        assert_eq!(closed.duration_seconds, 90);
        assert_eq!(closed.metadata.version, 2);
    }

    #[test]
    fn closing_before_start_clamps() {
        let clock = FixedClock::default();
        let peer = PeerId::from("a");
        let start = clock.now();
        let entry = TimeLogEntry::start("l1", "Focus", start, &peer);
        let closed = entry.closed_at(start - chrono::Duration::seconds(5), &peer, start);
        assert_eq!(closed.end_time, Some(start));
        assert_eq!(closed.duration_seconds, 0);
    }

    #[test]
    fn record_serializes_with_entity_tag() {
        let clock = FixedClock::default();
        let list = TaskList::new("l", "Inbox", &PeerId::from("a"), clock.now());
        let value = serde_json::to_value(Record::from(list)).unwrap();
        assert_eq!(value["entityType"], "taskList");
        assert_eq!(value["record"]["name"], "Inbox");
        assert_eq!(value["record"]["metadata"]["version"], 1);
    }

    #[test]
    fn sync_order_puts_lists_first() {
        assert_eq!(EntityType::SYNC_ORDER[0], EntityType::TaskList);
        assert_eq!(EntityType::Goal.as_str(), "goal");
    }
}
