//! A binary max-heap over keys that supports re-prioritizing queued entries.
//!
//! Unlike [std::collections::BinaryHeap], [Heap] remembers where each key currently sits so that
//! its priority can be changed in `O(log n)` (via [Heap::fix]) without removing and re-inserting it.

use std::{collections::HashMap, hash::Hash};

/// A binary max-heap keyed by `K` and ordered by `P`.
pub struct Heap<K: Eq + Hash + Clone, P: Ord> {
    entries: Vec<(K, P)>,
    positions: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, P: Ord> Default for Heap<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, P: Ord> Heap<K, P> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Number of queued keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is queued.
    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// The key with the greatest priority, if any.
    pub fn peek(&self) -> Option<(&K, &P)> {
        self.entries.first().map(|(key, priority)| (key, priority))
    }

    /// Insert `key` with `priority`.
    ///
    /// If `key` is already queued, its priority is replaced instead.
    pub fn push(&mut self, key: K, priority: P) {
        let priority = match self.fix(&key, priority) {
            Ok(()) => return,
            Err(priority) => priority,
        };
        let index = self.entries.len();
        self.positions.insert(key.clone(), index);
        self.entries.push((key, priority));
        self.sift_up(index);
    }

    /// Remove and return the key with the greatest priority.
    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(0, last);
        let (key, priority) = self.entries.pop()?;
        self.positions.remove(&key);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some((key, priority))
    }

    /// Replace the priority of a queued `key` and restore heap order.
    ///
    /// Returns the priority back if `key` is not queued.
    pub fn fix(&mut self, key: &K, priority: P) -> Result<(), P> {
        let Some(&index) = self.positions.get(key) else {
            return Err(priority);
        };
        self.entries[index].1 = priority;
        if !self.sift_up(index) {
            self.sift_down(index);
        }
        Ok(())
    }

    /// Remove a queued `key`, returning its priority.
    pub fn remove(&mut self, key: &K) -> Option<P> {
        let index = *self.positions.get(key)?;
        let last = self.entries.len() - 1;
        self.swap(index, last);
        let (key, priority) = self.entries.pop()?;
        self.positions.remove(&key);

        // The entry moved into the hole may need to go either way
        if index < self.entries.len() && !self.sift_up(index) {
            self.sift_down(index);
        }
        Some(priority)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].0.clone(), a);
        self.positions.insert(self.entries[b].0.clone(), b);
    }

    /// Returns whether the entry moved.
    fn sift_up(&mut self, mut index: usize) -> bool {
        let start = index;
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].1 <= self.entries[parent].1 {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index != start
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut largest = index;
            if left < len && self.entries[left].1 > self.entries[largest].1 {
                largest = left;
            }
            if right < len && self.entries[right].1 > self.entries[largest].1 {
                largest = right;
            }
            if largest == index {
                return;
            }
            self.swap(index, largest);
            index = largest;
        }
    }
}
