//! Bounded memory of applied push sessions, for loop prevention.

use std::collections::{HashSet, VecDeque};

/// Remembers the most recent `capacity` keys; older ones are forgotten
/// first.
#[derive(Debug, Clone)]
pub struct SessionWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl SessionWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Key for one payload of one push session.
    pub fn key(session_id: &str, data_type: &str) -> String {
        format!("{session_id}/{data_type}")
    }

    /// Remember `key`. Returns `false` if it was already remembered.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
