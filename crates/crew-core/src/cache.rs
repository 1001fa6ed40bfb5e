//! Bounded live output cache.
//!
//! Each session keeps its decoded events in an `OutputCache` so that
//! subscribers joining late can replay history. The cache is append-only;
//! once `capacity` is reached the oldest events are evicted first.
//!
//! The cache itself is not synchronized. Its owner (the session actor)
//! takes replay snapshots in the same serialized step that appends, so an
//! eviction can never interleave with a replay copy.

use std::collections::VecDeque;

use crate::event::StreamEvent;
use crate::session::LaunchToken;

/// Default maximum number of events kept per session.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Ordered, bounded buffer of stream events.
#[derive(Debug, Clone)]
pub struct OutputCache {
    events: VecDeque<StreamEvent>,
    capacity: usize,
    evicted: u64,
}

impl OutputCache {
    /// Creates an empty cache. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Appends an event, returning the evicted one if the cap was reached.
    pub fn push(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        let evicted = if self.events.len() >= self.capacity {
            self.evicted = self.evicted.saturating_add(1);
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of events evicted since creation.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Sequence number of the oldest retained event.
    pub fn first_seq(&self) -> Option<u64> {
        self.events.front().map(|e| e.seq)
    }

    /// Sequence number of the newest event.
    pub fn last_seq(&self) -> Option<u64> {
        self.events.back().map(|e| e.seq)
    }

    /// Copies the full retained history.
    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.events.iter().cloned().collect()
    }

    /// Copies events with `seq > after`.
    pub fn since(&self, after: u64) -> Vec<StreamEvent> {
        self.events
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    /// Copies the events produced by one attachment.
    pub fn for_token(&self, token: &LaunchToken) -> Vec<StreamEvent> {
        self.events
            .iter()
            .filter(|e| &e.launch_token == token)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }
}

impl Default for OutputCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
