//! `(req_time, id)`-ordered priority queue shared by SPQ and Voting.
//!
//! Grounded on `original_source/Lamport-Shared-Priority-Queue/node/priority-queue.go`
//! and `Voting-Protocol/node/priority-queue.go`, both a `container/heap` keyed
//! by `(TimeStamp, ID)` with ties broken on the smaller id. `BinaryHeap` is
//! Rust's idiomatic replacement for Go's `container/heap` interface; wrapping
//! entries in `Reverse` turns the (max-heap by default) `BinaryHeap` into the
//! min-heap the original `Less` implementation expresses.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::clock::priority_order;

/// A pending request: `(request time, requester id)`.
pub type Entry = (i64, u32);

/// Wraps an `Entry` so the heap's ordering is defined by `clock::priority_order`
/// rather than a second, independent derivation of the same `(req_time, id)`
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ranked(Entry);

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        priority_order(self.0, other.0)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PriorityQueue {
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, entry: Entry) {
        self.heap.push(Reverse(Ranked(entry)));
    }

    pub fn peek(&self) -> Option<Entry> {
        self.heap.peek().map(|Reverse(Ranked(e))| *e)
    }

    pub fn pop(&mut self) -> Option<Entry> {
        self.heap.pop().map(|Reverse(Ranked(e))| e)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_timestamp_then_id_order() {
        let mut q = PriorityQueue::new();
        q.push((5, 2));
        q.push((3, 9));
        q.push((5, 1));
        assert_eq!(q.pop(), Some((3, 9)));
        assert_eq!(q.pop(), Some((5, 1)));
        assert_eq!(q.pop(), Some((5, 2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = PriorityQueue::new();
        q.push((1, 0));
        assert_eq!(q.peek(), Some((1, 0)));
        assert_eq!(q.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn pop_order_matches_sorted_order(mut entries in proptest::collection::vec((0i64..50, 0u32..20), 0..30)) {
            let mut q = PriorityQueue::new();
            for e in &entries {
                q.push(*e);
            }
            entries.sort();
            let mut popped = vec![];
            while let Some(e) = q.pop() {
                popped.push(e);
            }
            proptest::prop_assert_eq!(popped, entries);
        }
    }
}
