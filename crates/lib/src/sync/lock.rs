//! Per-peer exclusive lock around push and pull runs.
//!
//! At most one sync per peer id runs at a time; different peers sync
//! concurrently. Acquisition never waits: a second request for a held peer
//! fails with [`SyncError::OperationInProgress`]. A lock older than the
//! timeout is assumed to belong to a task that died and is taken over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::error::SyncError;
use super::peer_types::PeerId;
use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: u64,
    acquired_at: DateTime<Utc>,
}

type Holders = Arc<Mutex<HashMap<PeerId, Holder>>>;

/// Exclusive per-peer lock with forced release after a timeout.
#[derive(Debug)]
pub struct SyncLock {
    holders: Holders,
    timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
    next_token: AtomicU64,
}

impl SyncLock {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            holders: Arc::new(Mutex::new(HashMap::new())),
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX),
            clock,
            next_token: AtomicU64::new(1),
        }
    }

    /// Take the lock for `peer`, or fail fast if a live holder exists.
    pub fn try_acquire(&self, peer: &PeerId) -> Result<SyncLockGuard, SyncError> {
        let now = self.clock.now();
        let mut holders = self.holders.lock().unwrap();
        if let Some(holder) = holders.get(peer) {
            if !self.is_expired(holder, now) {
                return Err(SyncError::OperationInProgress { peer: peer.clone() });
            }
            warn!(%peer, held_since = %holder.acquired_at, "Force-releasing expired sync lock");
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        holders.insert(
            peer.clone(),
            Holder {
                token,
                acquired_at: now,
            },
        );
        Ok(SyncLockGuard {
            holders: self.holders.clone(),
            peer: peer.clone(),
            token,
        })
    }

    /// Whether a live (unexpired) holder exists for `peer`.
    pub fn is_locked(&self, peer: &PeerId) -> bool {
        let now = self.clock.now();
        self.holders
            .lock()
            .unwrap()
            .get(peer)
            .is_some_and(|h| !self.is_expired(h, now))
    }

    /// Peers currently holding a live lock, sorted.
    pub fn held(&self) -> Vec<PeerId> {
        let now = self.clock.now();
        let mut peers: Vec<PeerId> = self
            .holders
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| !self.is_expired(h, now))
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Drop every expired holder. Returns the peers released.
    pub fn release_expired(&self) -> Vec<PeerId> {
        let now = self.clock.now();
        let mut holders = self.holders.lock().unwrap();
        let expired: Vec<PeerId> = holders
            .iter()
            .filter(|(_, h)| self.is_expired(h, now))
            .map(|(p, _)| p.clone())
            .collect();
        for peer in &expired {
            warn!(%peer, "Force-releasing expired sync lock");
            holders.remove(peer);
        }
        expired
    }

    fn is_expired(&self, holder: &Holder, now: DateTime<Utc>) -> bool {
        now - holder.acquired_at >= self.timeout
    }
}

/// Releases the peer's lock on drop, unless it was taken over in the
/// meantime.
#[derive(Debug)]
#[must_use = "the lock is released when the guard is dropped"]
pub struct SyncLockGuard {
    holders: Holders,
    peer: PeerId,
    token: u64,
}

impl SyncLockGuard {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        let mut holders = self.holders.lock().unwrap();
        if holders.get(&self.peer).is_some_and(|h| h.token == self.token) {
            holders.remove(&self.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn lock(clock: &Arc<FixedClock>) -> SyncLock {
        SyncLock::new(Duration::from_secs(300), clock.clone())
    }

    #[test]
    fn second_acquire_fails_fast() {
        let clock = Arc::new(FixedClock::default());
        let lock = lock(&clock);
        let peer = PeerId::from("b");
        let _guard = lock.try_acquire(&peer).unwrap();
        let err = lock.try_acquire(&peer).unwrap_err();
        assert!(err.is_in_progress());
        assert!(lock.is_locked(&peer));
    }

    #[test]
    fn different_peers_do_not_contend() {
        let clock = Arc::new(FixedClock::default());
        let lock = lock(&clock);
        let _a = lock.try_acquire(&PeerId::from("a")).unwrap();
        let _b = lock.try_acquire(&PeerId::from("b")).unwrap();
        assert_eq!(lock.held(), vec![PeerId::from("a"), PeerId::from("b")]);
    }

    #[test]
    fn drop_releases() {
        let clock = Arc::new(FixedClock::default());
        let lock = lock(&clock);
        let peer = PeerId::from("b");
        drop(lock.try_acquire(&peer).unwrap());
        assert!(!lock.is_locked(&peer));
        assert!(lock.try_acquire(&peer).is_ok());
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let clock = Arc::new(FixedClock::default());
        let lock = lock(&clock);
        let peer = PeerId::from("b");
        let stale = lock.try_acquire(&peer).unwrap();

        clock.advance(Duration::from_secs(299));
        assert!(lock.try_acquire(&peer).is_err());
        clock.advance(Duration::from_secs(1));
        assert!(!lock.is_locked(&peer));
        let fresh = lock.try_acquire(&peer).unwrap();

        // The stale guard must not release the new holder.
        drop(stale);
        assert!(lock.is_locked(&peer));
        drop(fresh);
        assert!(!lock.is_locked(&peer));
    }

    #[test]
    fn release_expired_sweeps() {
        let clock = Arc::new(FixedClock::default());
        let lock = lock(&clock);
        let _guard = lock.try_acquire(&PeerId::from("b")).unwrap();
        assert!(lock.release_expired().is_empty());
        clock.advance(Duration::from_secs(301));
        assert_eq!(lock.release_expired(), vec![PeerId::from("b")]);
        assert!(lock.held().is_empty());
    }
}
