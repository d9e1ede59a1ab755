//! Sync job queue with per-job exponential retry.
//!
//! Jobs are drained by the single background worker, one at a time. A job
//! is only handed out when it is due and no older job for the same peer is
//! still waiting, so retries never reorder work for a peer. A failed job
//! goes back to the front of the queue with a backoff delay until it runs
//! out of retries.
//!
//! This is an in-memory queue - jobs are lost on restart. Incremental
//! filtering against the last successful sync catches up after restart.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SyncMode;
use super::peer_types::PeerId;
use crate::config::OrchestratorConfig;

/// Which way records flow in a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::Push => f.write_str("push"),
            SyncDirection::Pull => f.write_str("pull"),
        }
    }
}

/// A queued push or pull for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: String,
    pub peer_id: PeerId,
    pub direction: SyncDirection,
    pub mode: SyncMode,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Not run before this instant.
    pub not_before: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(peer_id: PeerId, direction: SyncDirection, mode: SyncMode, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id,
            direction,
            mode,
            retry_count: 0,
            created_at: now,
            not_before: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

/// Retry schedule for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(config.min_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            max_retries: config.max_retries,
        }
    }

    /// Wait before retry number `retry_count` (one-based):
    /// `min(min_delay * 2^(retry_count - 1), max_delay)`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// What happened to a job that failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Requeued to run after `delay`.
    Scheduled { delay: Duration, retry_count: u32 },
    /// Out of retries; the job was dropped.
    GaveUp { job: SyncJob },
}

/// Thread-safe FIFO of sync jobs.
#[derive(Debug)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<SyncJob>>,
    policy: RetryPolicy,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl JobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Queue a job. A fresh identical job already waiting absorbs the new
    /// one and is returned instead.
    pub fn enqueue(&self, job: SyncJob) -> SyncJob {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.iter().find(|j| {
            j.peer_id == job.peer_id
                && j.direction == job.direction
                && j.mode == job.mode
                && j.retry_count == 0
        }) {
            return existing.clone();
        }
        jobs.push_back(job.clone());
        job
    }

    /// Remove and return the first job that is due and not blocked behind
    /// an older job for the same peer.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Option<SyncJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut blocked: HashSet<PeerId> = HashSet::new();
        let mut ready = None;
        for (index, job) in jobs.iter().enumerate() {
            if blocked.contains(&job.peer_id) {
                continue;
            }
            if job.is_due(now) {
                ready = Some(index);
                break;
            }
            blocked.insert(job.peer_id.clone());
        }
        ready.and_then(|index| jobs.remove(index))
    }

    /// Record a failure of `job` and either requeue it ahead of the peer's
    /// other jobs or drop it.
    pub fn retry(&self, mut job: SyncJob, now: DateTime<Utc>) -> RetryDecision {
        job.retry_count += 1;
        if job.retry_count > self.policy.max_retries {
            return RetryDecision::GaveUp { job };
        }
        let delay = self.policy.delay(job.retry_count);
        job.not_before = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let retry_count = job.retry_count;
        self.jobs.lock().unwrap().push_front(job);
        RetryDecision::Scheduled { delay, retry_count }
    }

    /// Drop every queued job. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let dropped = jobs.len();
        jobs.clear();
        dropped
    }

    /// Drop the queued jobs for one peer.
    pub fn remove_peer(&self, peer: &PeerId) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| &j.peer_id != peer);
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }

    /// Copy of the queue in drain order.
    pub fn snapshot(&self) -> Vec<SyncJob> {
        self.jobs.lock().unwrap().iter().cloned().collect()
    }
}
