// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::collections::arena::Arena;

//==============================================================================
// Constants
//==============================================================================

/// Initial number of heap slots. The backing array doubles whenever it fills up.
const INITIAL_CAPACITY: usize = 16;

//==============================================================================
// Structures
//==============================================================================

/// Handle to an armed timer entry. Stale once the entry fires or is removed.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct TimerId(u64);

struct TimerEntry<T> {
    /// Current offset of this entry in the heap array.
    position: usize,
    payload: T,
}

/// Binary min-heap of deadlines (milliseconds on the scheduler's monotonic clock), array-backed. Every entry is also
/// reachable through its [TimerId], which lets a canceled entry be taken out of the heap right away instead of lingering
/// until its deadline.
///
/// Firing order among equal deadlines is unspecified.
pub struct TimerHeap<T> {
    /// Heap-ordered (deadline, id) pairs. For every non-root node, its deadline is not less than its parent's.
    heap: Vec<(i64, TimerId)>,
    entries: Arena<TimerId, TimerEntry<T>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<T> TimerHeap<T> {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(INITIAL_CAPACITY),
            entries: Arena::default(),
        }
    }

    /// Arms a new entry that expires at `deadline`.
    pub fn push(&mut self, deadline: i64, payload: T) -> TimerId {
        let position: usize = self.heap.len();
        if position == self.heap.capacity() {
            self.heap.reserve_exact(position.max(INITIAL_CAPACITY));
        }
        let id: TimerId = self.entries.insert(TimerEntry { position, payload });
        self.heap.push((deadline, id));
        self.sift_up(position);
        id
    }

    /// Returns the earliest deadline without removing it.
    pub fn peek(&self) -> Option<(i64, TimerId)> {
        self.heap.first().copied()
    }

    /// Removes the entry with the earliest deadline.
    pub fn pop(&mut self) -> Option<(i64, T)> {
        let (deadline, id) = self.peek()?;
        self.remove(id).map(|payload| (deadline, payload))
    }

    /// Removes the entry behind `id`, wherever it sits in the heap. Returns `None` if it already fired or was removed.
    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        let entry: TimerEntry<T> = self.entries.remove(id)?;
        let position: usize = entry.position;
        let last: usize = self.heap.len() - 1;
        self.heap.swap(position, last);
        self.heap.pop();
        if position < self.heap.len() {
            self.reposition(position);
            // The element moved into the hole may belong above or below it.
            if !self.sift_up(position) {
                self.sift_down(position);
            }
        }
        Some(entry.payload)
    }

    /// Removes every entry whose payload matches `predicate` and returns their payloads.
    pub fn remove_where<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) -> Vec<T> {
        let ids: Vec<TimerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.payload))
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains(id)
    }

    /// Payload of the entry behind `id`.
    pub fn get(&self, id: TimerId) -> Option<&T> {
        self.entries.get(id).map(|entry| &entry.payload)
    }

    /// Deadline of the entry behind `id`.
    pub fn deadline(&self, id: TimerId) -> Option<i64> {
        self.entries.get(id).map(|entry| self.heap[entry.position].0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes every entry and returns their payloads.
    pub fn clear(&mut self) -> Vec<T> {
        self.heap.clear();
        self.entries.drain().into_iter().map(|entry| entry.payload).collect()
    }

    /// Moves the element at `position` towards the root. Returns true if it moved.
    fn sift_up(&mut self, mut position: usize) -> bool {
        let start: usize = position;
        while position > 0 {
            let parent: usize = (position - 1) / 2;
            if self.heap[parent].0 <= self.heap[position].0 {
                break;
            }
            self.heap.swap(parent, position);
            self.reposition(position);
            position = parent;
        }
        self.reposition(position);
        position != start
    }

    /// Moves the element at `position` towards the leaves.
    fn sift_down(&mut self, mut position: usize) {
        let len: usize = self.heap.len();
        loop {
            let left: usize = 2 * position + 1;
            let right: usize = left + 1;
            let mut smallest: usize = position;
            if left < len && self.heap[left].0 < self.heap[smallest].0 {
                smallest = left;
            }
            if right < len && self.heap[right].0 < self.heap[smallest].0 {
                smallest = right;
            }
            if smallest == position {
                break;
            }
            self.heap.swap(smallest, position);
            self.reposition(position);
            position = smallest;
        }
        self.reposition(position);
    }

    /// Records in the entry table where the element at `position` now lives.
    fn reposition(&mut self, position: usize) {
        let id: TimerId = self.heap[position].1;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.position = position;
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for TimerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TimerId> for u64 {
    fn from(value: TimerId) -> Self {
        value.0
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
