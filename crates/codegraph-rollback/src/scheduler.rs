//! Min-heap of pending rollback point expiries.
//!
//! One periodic tick drains due entries instead of running a timer per point.
//! Rescheduling or cancelling only updates `scheduled`; superseded heap
//! entries are discarded when they surface, and the heap is rebuilt once
//! they outnumber the live ones.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::types::RollbackPointId;

/// Stale heap entries tolerated before a rebuild.
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Default)]
pub(crate) struct ExpiryQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, RollbackPointId)>>,
    scheduled: HashMap<RollbackPointId, DateTime<Utc>>,
}

impl ExpiryQueue {
    pub(crate) fn schedule(&mut self, id: &str, at: DateTime<Utc>) {
        if self.scheduled.insert(id.to_string(), at) == Some(at) {
            return;
        }
        self.heap.push(Reverse((at, id.to_string())));
        self.compact_if_sparse();
    }

    pub(crate) fn cancel(&mut self, id: &str) -> bool {
        let cancelled = self.scheduled.remove(id).is_some();
        if cancelled {
            self.compact_if_sparse();
        }
        cancelled
    }

    fn compact_if_sparse(&mut self) {
        if self.heap.len() > 2 * self.scheduled.len() + COMPACT_SLACK {
            self.heap = self
                .scheduled
                .iter()
                .map(|(id, at)| Reverse((*at, id.clone())))
                .collect();
        }
    }

    /// Remove and return every id due at `now`, earliest first.
    pub(crate) fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<RollbackPointId> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, id))) = self.heap.pop() else {
                break;
            };
            if self.scheduled.get(&id) == Some(&at) {
                self.scheduled.remove(&id);
                due.push(id);
            }
        }
        due
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.scheduled.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.scheduled.len()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
