//! Size-capped, append-only buffers.
//!
//! Used for the pool's audit log and each context's run history. What happens
//! on overflow is an explicit [`EvictionPolicy`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// How a full [`BoundedLog`] makes room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Once the capacity is exceeded, discard the oldest half in one batch.
    #[default]
    DropOldestHalf,
    /// Discard exactly the oldest entry for each entry over capacity.
    Fifo,
}

/// An ordered buffer that never holds more than `capacity` entries.
#[derive(Clone, Debug)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
    policy: EvictionPolicy,
    evicted: u64,
}

impl<T> BoundedLog<T> {
    /// Create an empty log. A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
            evicted: 0,
        }
    }

    /// Append an entry, evicting per policy when the capacity is exceeded.
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        if self.entries.len() <= self.capacity {
            return;
        }
        let excess = match self.policy {
            EvictionPolicy::Fifo => self.entries.len() - self.capacity,
            // Keep the most recent half of the configured capacity.
            EvictionPolicy::DropOldestHalf => self.entries.len() - (self.capacity / 2).max(1),
        };
        drop(self.entries.drain(..excess));
        self.evicted += excess as u64;
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<&T> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries discarded by eviction since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
