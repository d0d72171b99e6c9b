//! Bounded replay log of recently broadcast events.
//!
//! The log holds at most `capacity` events in insertion order. Appending past
//! capacity evicts the oldest entry first. Reconnecting clients ask for every
//! event after the last id they saw; see [`EventStore::get_since`] and
//! [`EventStore::replay`].

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use relay_types::Event;

/// Outcome of a replay request.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    /// The client did not supply a last-seen id.
    Fresh,
    /// The last-seen id is the newest stored event; nothing to replay.
    UpToDate,
    /// Events strictly after the last-seen id, oldest first.
    Events(Vec<Event>),
    /// The last-seen id is not in the log (evicted, or never issued by this
    /// process). Some events may have been missed.
    Gap,
}

/// Fixed-capacity, insertion-ordered event log.
#[derive(Debug)]
pub struct EventStore {
    capacity: usize,
    log: RwLock<VecDeque<Event>>,
}

impl EventStore {
    /// Creates a store holding at most `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            tracing::warn!("event store capacity must be positive, using 1");
            1
        } else {
            capacity
        };
        Self {
            capacity,
            log: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends an event, evicting the oldest entry when full.
    pub fn add(&self, event: Event) {
        let mut log = self.write_log();
        log.push_back(event);
        while log.len() > self.capacity {
            log.pop_front();
        }
    }

    /// Returns every stored event strictly after `last_id`, in insertion order.
    ///
    /// An empty, unknown or evicted `last_id` yields an empty vector in all
    /// three cases. Use [`EventStore::replay`] to tell them apart.
    pub fn get_since(&self, last_id: &str) -> Vec<Event> {
        match self.replay(last_id) {
            Replay::Events(events) => events,
            Replay::Fresh | Replay::UpToDate | Replay::Gap => Vec::new(),
        }
    }

    /// Like [`EventStore::get_since`], but reports why nothing was returned.
    pub fn replay(&self, last_id: &str) -> Replay {
        if last_id.is_empty() {
            return Replay::Fresh;
        }
        let log = self.read_log();
        match log.iter().position(|e| e.id == last_id) {
            Some(pos) if pos + 1 == log.len() => Replay::UpToDate,
            Some(pos) => Replay::Events(log.iter().skip(pos + 1).cloned().collect()),
            None => Replay::Gap,
        }
    }

    /// Id of the newest stored event.
    pub fn last_id(&self) -> Option<String> {
        self.read_log().back().map(|e| e.id.clone())
    }

    pub fn len(&self) -> usize {
        self.read_log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_log().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_log(&self) -> RwLockReadGuard<'_, VecDeque<Event>> {
        self.log.read().unwrap_or_else(|poisoned| {
            tracing::error!("event store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_log(&self) -> RwLockWriteGuard<'_, VecDeque<Event>> {
        self.log.write().unwrap_or_else(|poisoned| {
            tracing::error!("event store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
