//! Timer queues — per-CPU ordered collections of armed timers
//!
//! Keys order by date ascending, then priority descending, then arming
//! sequence, so equal (date, priority) timers fire in arming order.
//! Two interchangeable backings: an insertion-sorted list and a bounded
//! binary heap.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::clock::Ticks;
use crate::error::{Error, Result};
use crate::timer::TimerId;

/// Capacity of each per-CPU timer heap
pub const TIMER_HEAP_CAPACITY: usize = 256;

/// Queue backing selected at kernel setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Insertion-sorted list, unbounded, O(n) insert
    List,
    /// Bounded binary heap, O(log n) insert
    Heap,
}

/// Ordering key of a queued timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    /// Absolute expiry (raw ticks)
    pub date: Ticks,
    /// Tie-break at equal date: higher fires first
    pub prio: i32,
    /// Arming sequence: earlier fires first
    pub seq: u64,
    /// Timer this key belongs to
    pub id: TimerId,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| other.prio.cmp(&self.prio))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Insertion-sorted list
#[derive(Debug, Default)]
pub struct ListQueue {
    keys: Vec<TimerKey>,
}

impl ListQueue {
    fn insert(&mut self, key: TimerKey) {
        let pos = self.keys.partition_point(|k| *k <= key);
        self.keys.insert(pos, key);
    }

    fn remove(&mut self, id: TimerId) -> Option<TimerKey> {
        let pos = self.keys.iter().position(|k| k.id == id)?;
        Some(self.keys.remove(pos))
    }

    fn head(&self) -> Option<&TimerKey> {
        self.keys.first()
    }

    fn is_sorted(&self) -> bool {
        self.keys.windows(2).all(|w| w[0] <= w[1])
    }
}

/// Bounded binary min-heap
pub struct HeapQueue {
    keys: heapless::Vec<TimerKey, TIMER_HEAP_CAPACITY>,
}

impl HeapQueue {
    fn new() -> Self {
        Self {
            keys: heapless::Vec::new(),
        }
    }

    fn insert(&mut self, key: TimerKey) -> Result<()> {
        self.keys.push(key).map_err(|_| Error::Busy)?;
        self.sift_up(self.keys.len() - 1);
        Ok(())
    }

    fn remove(&mut self, id: TimerId) -> Option<TimerKey> {
        let pos = self.keys.iter().position(|k| k.id == id)?;
        let last = self.keys.len() - 1;
        self.keys.swap(pos, last);
        let key = self.keys.pop();
        if pos < self.keys.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        key
    }

    fn head(&self) -> Option<&TimerKey> {
        self.keys.first()
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.keys[pos] >= self.keys[parent] {
                break;
            }
            self.keys.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.keys.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.keys[left] < self.keys[smallest] {
                smallest = left;
            }
            if right < len && self.keys[right] < self.keys[smallest] {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.keys.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn is_sorted(&self) -> bool {
        (1..self.keys.len()).all(|i| self.keys[(i - 1) / 2] <= self.keys[i])
    }
}

/// Per-CPU timer queue
pub enum TimerQueue {
    /// Sorted list backing
    List(ListQueue),
    /// Binary heap backing
    Heap(HeapQueue),
}

impl TimerQueue {
    /// Empty queue of the given kind
    pub fn new(kind: QueueKind) -> Self {
        match kind {
            QueueKind::List => TimerQueue::List(ListQueue::default()),
            QueueKind::Heap => TimerQueue::Heap(HeapQueue::new()),
        }
    }

    /// Backing kind
    pub fn kind(&self) -> QueueKind {
        match self {
            TimerQueue::List(_) => QueueKind::List,
            TimerQueue::Heap(_) => QueueKind::Heap,
        }
    }

    /// Insert in order; fails with `Busy` when a heap is full
    pub fn insert(&mut self, key: TimerKey) -> Result<()> {
        match self {
            TimerQueue::List(q) => {
                q.insert(key);
                Ok(())
            }
            TimerQueue::Heap(q) => q.insert(key),
        }
    }

    /// Remove the key of timer `id`, if queued
    pub fn remove(&mut self, id: TimerId) -> Option<TimerKey> {
        match self {
            TimerQueue::List(q) => q.remove(id),
            TimerQueue::Heap(q) => q.remove(id),
        }
    }

    /// Earliest key
    pub fn head(&self) -> Option<&TimerKey> {
        match self {
            TimerQueue::List(q) => q.head(),
            TimerQueue::Heap(q) => q.head(),
        }
    }

    /// Remove and return the earliest key
    pub fn pop(&mut self) -> Option<TimerKey> {
        let id = self.head()?.id;
        self.remove(id)
    }

    /// Number of queued timers
    pub fn len(&self) -> usize {
        match self {
            TimerQueue::List(q) => q.keys.len(),
            TimerQueue::Heap(q) => q.keys.len(),
        }
    }

    /// Nothing queued?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is the backing structure in order?
    pub fn is_sorted(&self) -> bool {
        match self {
            TimerQueue::List(q) => q.is_sorted(),
            TimerQueue::Heap(q) => q.is_sorted(),
        }
    }

    /// All keys in firing order
    pub fn keys(&self) -> Vec<TimerKey> {
        let mut keys: Vec<TimerKey> = match self {
            TimerQueue::List(q) => q.keys.clone(),
            TimerQueue::Heap(q) => q.keys.iter().copied().collect(),
        };
        keys.sort();
        keys
    }

    /// Is timer `id` queued here?
    pub fn contains(&self, id: TimerId) -> bool {
        match self {
            TimerQueue::List(q) => q.keys.iter().any(|k| k.id == id),
            TimerQueue::Heap(q) => q.keys.iter().any(|k| k.id == id),
        }
    }
}
