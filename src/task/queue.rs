//! Querier scheduling queue
//!
//! Queriers live in an arena and keep a stable index for the lifetime of
//! the task. A min-heap of `(last_update, seq, index)` entries orders them:
//! the querier updated longest ago is due first, and `seq` (insertion order)
//! breaks ties so equally-due queriers are served round-robin.

use crate::querier::TableQuerier;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

type Entry = Reverse<(i64, u64, usize)>;

/// Queriers ordered by their next eligible run time
#[derive(Default)]
pub struct QuerierQueue {
    queriers: Vec<Box<dyn TableQuerier>>,
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl QuerierQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a querier at the position given by its last update time
    pub fn push(&mut self, querier: Box<dyn TableQuerier>) {
        let index = self.queriers.len();
        let last_update = querier.last_update();
        self.queriers.push(querier);
        self.enqueue(last_update, index);
    }

    fn enqueue(&mut self, last_update: i64, index: usize) {
        self.heap.push(Reverse((last_update, self.seq, index)));
        self.seq += 1;
    }

    /// Arena index of the most eligible querier
    pub fn head_index(&self) -> Option<usize> {
        self.heap.peek().map(|Reverse((_, _, index))| *index)
    }

    pub fn head(&self) -> Option<&dyn TableQuerier> {
        self.head_index()
            .and_then(|index| self.queriers.get(index))
            .map(|q| q.as_ref())
    }

    pub fn head_mut(&mut self) -> Option<&mut (dyn TableQuerier + 'static)> {
        let index = self.head_index()?;
        self.queriers.get_mut(index).map(|q| q.as_mut())
    }

    /// Reset the head querier and move it behind everything due earlier
    pub fn requeue_head(&mut self, now_millis: i64) {
        if let Some(Reverse((_, _, index))) = self.heap.pop() {
            if let Some(querier) = self.queriers.get_mut(index) {
                querier.reset(now_millis);
                let last_update = querier.last_update();
                self.enqueue(last_update, index);
            }
        }
    }

    /// Queriers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &dyn TableQuerier> {
        self.queriers.iter().map(|q| q.as_ref())
    }

    pub fn len(&self) -> usize {
        self.queriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queriers.is_empty()
    }
}

impl std::fmt::Debug for QuerierQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.iter().map(|q| q.name()).collect();
        f.debug_struct("QuerierQueue")
            .field("queriers", &names)
            .field("head", &self.head_index())
            .finish()
    }
}
