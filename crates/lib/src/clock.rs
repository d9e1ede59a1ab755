//! Time provider abstraction
//!
//! This module provides a [`Clock`] trait that abstracts over time sources,
//! allowing production code to use real system time while tests can use
//! controllable mock time.
//!
//! Replica metadata, discovery TTLs, retry backoff and lock timeouts all read
//! time through a [`Clock`], so a [`FixedClock`] makes every one of them
//! deterministic.
//!
//! # Example
//!
//! ```
//! use lansync::{Clock, SystemClock};
//!
//! let clock = SystemClock;
//! let millis = clock.now_millis();
//! let rfc3339 = clock.now_rfc3339();
//! ```

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// A time provider for getting current timestamps.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now_millis(&self) -> u64;

    /// Returns the current time as a UTC datetime.
    fn now(&self) -> DateTime<Utc> {
        millis_to_datetime(self.now_millis())
    }

    /// Returns the current time as an RFC3339-formatted string.
    fn now_rfc3339(&self) -> String {
        self.now().to_rfc3339()
    }
}

/// Convert milliseconds since the Unix epoch into a UTC datetime.
///
/// Out-of-range values clamp to the epoch.
pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Production clock using real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Time only moves when [`FixedClock::advance`] or [`FixedClock::set`] is
/// called, so two reads with nothing in between always agree.
///
/// ```
/// use std::time::Duration;
/// use lansync::{Clock, FixedClock};
///
/// let clock = FixedClock::new(1000);
/// assert_eq!(clock.now_millis(), 1000);
/// clock.advance(Duration::from_secs(2));
/// assert_eq!(clock.now_millis(), 3000);
/// ```
pub struct FixedClock {
    millis: Mutex<u64>,
}

impl FixedClock {
    /// Create a new fixed clock with the given initial time in milliseconds.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Mutex::new(millis),
        }
    }

    /// Create a fixed clock positioned at the given datetime.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self::new(time.timestamp_millis().max(0) as u64)
    }

    /// Advance the clock.
    pub fn advance(&self, by: Duration) {
        *self.millis.lock().unwrap() += by.as_millis() as u64;
    }

    /// Set the clock to a specific time in milliseconds.
    pub fn set(&self, ms: u64) {
        *self.millis.lock().unwrap() = ms;
    }

    /// Set the clock to a specific datetime.
    pub fn set_time(&self, time: DateTime<Utc>) {
        self.set(time.timestamp_millis().max(0) as u64);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        *self.millis.lock().unwrap()
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        // 2024-01-01 00:00:00 UTC
        Self::new(1704067200000)
    }
}

impl Clone for FixedClock {
    fn clone(&self) -> Self {
        Self::new(self.now_millis())
    }
}

impl Debug for FixedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedClock")
            .field("millis", &self.now_millis())
            .finish()
    }
}
