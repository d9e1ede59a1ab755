//! Live timers: who is timing what right now.
//!
//! A running timer is ephemeral state shared with peers through the timer
//! messages. When the local device and a remote peer both run a timer for
//! the same entity, the later start wins. The registry below only decides;
//! the engine closes the losing local time-log entry or tells the losing
//! peer to stop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::peer_types::PeerId;
use crate::conflict::Winner;

/// A timer running on some peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTimerState {
    /// What is being timed, usually a task id.
    pub entity_id: String,
    pub label: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub current_duration_seconds: u64,
    pub peer_id: PeerId,
    /// Time-log entry the timer writes to. Only meaningful on its own peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_log_id: Option<String>,
}

impl LiveTimerState {
    pub fn new(
        entity_id: impl Into<String>,
        label: impl Into<String>,
        start_time: DateTime<Utc>,
        peer_id: PeerId,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            label: label.into(),
            start_time,
            current_duration_seconds: 0,
            peer_id,
            time_log_id: None,
        }
    }

    pub fn with_time_log(mut self, id: impl Into<String>) -> Self {
        self.time_log_id = Some(id.into());
        self
    }

    /// Copy with the duration brought up to `now`.
    pub fn at(&self, now: DateTime<Utc>) -> Self {
        Self {
            current_duration_seconds: (now - self.start_time).num_seconds().max(0) as u64,
            ..self.clone()
        }
    }
}

/// Which of two timers on the same entity keeps running.
///
/// The later start wins. Equal starts go to the greater peer id so both
/// sides reach the same answer.
pub fn arbitrate(local: &LiveTimerState, remote: &LiveTimerState) -> Winner {
    match local.start_time.cmp(&remote.start_time) {
        std::cmp::Ordering::Greater => Winner::Local,
        std::cmp::Ordering::Less => Winner::Remote,
        std::cmp::Ordering::Equal if local.peer_id >= remote.peer_id => Winner::Local,
        std::cmp::Ordering::Equal => Winner::Remote,
    }
}

/// A local/remote clash on one entity and how it was decided.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerConflict {
    /// The local timer keeps running; `remote` must be told to stop.
    LocalWins {
        local: LiveTimerState,
        remote: LiveTimerState,
    },
    /// The local timer was removed and its entry must be closed at the
    /// remote start.
    RemoteWins {
        local: LiveTimerState,
        remote: LiveTimerState,
    },
}

/// Registry of local and remote running timers.
#[derive(Debug, Default)]
pub struct LiveTimers {
    local: HashMap<String, LiveTimerState>,
    remote: HashMap<(PeerId, String), LiveTimerState>,
}

impl LiveTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self, entity_id: &str) -> Option<&LiveTimerState> {
        self.local.get(entity_id)
    }

    pub fn local_timers(&self) -> Vec<LiveTimerState> {
        let mut timers: Vec<_> = self.local.values().cloned().collect();
        timers.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        timers
    }

    /// Register a local timer. Remote timers on the same entity that it
    /// beats are removed and returned as [`TimerConflict::LocalWins`];
    /// if a remote timer beats it instead the local timer is not kept.
    pub fn start_local(&mut self, timer: LiveTimerState) -> Vec<TimerConflict> {
        self.local.insert(timer.entity_id.clone(), timer.clone());
        let rivals: Vec<LiveTimerState> = self
            .remote
            .values()
            .filter(|r| r.entity_id == timer.entity_id)
            .cloned()
            .collect();
        rivals
            .into_iter()
            .filter_map(|remote| self.settle(&timer.entity_id, remote))
            .collect()
    }

    pub fn stop_local(&mut self, entity_id: &str) -> Option<LiveTimerState> {
        self.local.remove(entity_id)
    }

    /// Record a remote `timerStart`/`timerUpdate` and settle it against a
    /// local timer on the same entity.
    pub fn observe_remote(&mut self, timer: LiveTimerState) -> Option<TimerConflict> {
        let key = (timer.peer_id.clone(), timer.entity_id.clone());
        self.remote.insert(key, timer.clone());
        let entity_id = timer.entity_id.clone();
        self.settle(&entity_id, timer)
    }

    pub fn remove_remote(&mut self, peer: &PeerId, entity_id: &str) -> Option<LiveTimerState> {
        self.remote.remove(&(peer.clone(), entity_id.to_string()))
    }

    /// Forget every timer of a disconnected peer.
    pub fn clear_peer(&mut self, peer: &PeerId) -> usize {
        let before = self.remote.len();
        self.remote.retain(|(p, _), _| p != peer);
        before - self.remote.len()
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    /// Pairs of local and `peer` timers on the same entity, settled.
    pub fn settle_with(&mut self, peer: &PeerId) -> Vec<TimerConflict> {
        let rivals: Vec<LiveTimerState> = self
            .remote
            .iter()
            .filter(|((p, _), _)| p == peer)
            .map(|(_, t)| t.clone())
            .collect();
        rivals
            .into_iter()
            .filter_map(|remote| {
                let entity_id = remote.entity_id.clone();
                self.settle(&entity_id, remote)
            })
            .collect()
    }

    /// Every running timer, local first, each ordered by entity.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<LiveTimerState> {
        let mut remote: Vec<_> = self.remote.values().map(|t| t.at(now)).collect();
        remote.sort_by(|a, b| (&a.entity_id, &a.peer_id).cmp(&(&b.entity_id, &b.peer_id)));
        let mut timers: Vec<_> = self.local_timers().iter().map(|t| t.at(now)).collect();
        timers.extend(remote);
        timers
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    fn settle(&mut self, entity_id: &str, remote: LiveTimerState) -> Option<TimerConflict> {
        let local = self.local.get(entity_id)?.clone();
        match arbitrate(&local, &remote) {
            Winner::Local => {
                self.remote
                    .remove(&(remote.peer_id.clone(), remote.entity_id.clone()));
                Some(TimerConflict::LocalWins { local, remote })
            }
            Winner::Remote => {
                self.local.remove(entity_id);
                Some(TimerConflict::RemoteWins { local, remote })
            }
        }
    }
}
