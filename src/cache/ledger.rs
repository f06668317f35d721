//! Access ledger: bounded log of recent cache events.
//!
//! Oldest events fall off the front once capacity is reached. Readers take
//! snapshots instead of iterating the live buffer.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::cache::item::AccessEvent;

pub struct AccessLedger {
    events: Mutex<VecDeque<AccessEvent>>,
    capacity: usize,
}

impl AccessLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, event: AccessEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The `n` most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AccessEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    /// Copy of the full buffer, oldest first.
    pub fn snapshot(&self) -> Vec<AccessEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
