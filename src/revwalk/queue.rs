//! Commit-time priority queue for the revision walker.
//!
//! Pops newest-committed first; equal timestamps break toward the higher
//! generation number (a descendant can never have a lower generation than
//! its ancestor, so this keeps children ahead of parents under timestamp
//! skew). Remaining ties pop in insertion order for determinism.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QueueKey {
    time: i64,
    generation: u32,
    /// Insertion counter, inverted so earlier pushes pop first on full tie.
    seq: u64,
    slot: u32,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.generation.cmp(&other.generation))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap over `(commit time, generation)` holding walker slot indexes.
#[derive(Debug, Default)]
pub struct DateQueue {
    heap: BinaryHeap<QueueKey>,
    next_seq: u64,
}

impl DateQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a slot with its ordering key.
    pub fn push(&mut self, slot: u32, time: i64, generation: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueKey {
            time,
            generation,
            seq,
            slot,
        });
    }

    /// Pops the newest pending slot.
    pub fn pop(&mut self) -> Option<u32> {
        self.heap.pop().map(|key| key.slot)
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of pending slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_newest_first() {
        let mut queue = DateQueue::new();
        queue.push(1, 100, 0);
        queue.push(2, 300, 0);
        queue.push(3, 200, 0);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn equal_times_break_by_generation() {
        let mut queue = DateQueue::new();
        queue.push(1, 100, 4);
        queue.push(2, 100, 9);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn full_ties_pop_in_insertion_order() {
        let mut queue = DateQueue::new();
        queue.push(7, 100, 1);
        queue.push(8, 100, 1);
        queue.push(9, 100, 1);
        assert_eq!(queue.pop(), Some(7));
        assert_eq!(queue.pop(), Some(8));
        assert_eq!(queue.pop(), Some(9));
    }
}
