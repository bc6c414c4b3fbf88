//! Priority-ordered ready queue.
//!
//! One FIFO bucket per priority level plus a descending index of levels
//! that had a thread inserted. Emptied levels are left in the index and
//! skipped lazily by [`PriorityQueue::first`]; inserting into an empty
//! bucket re-adds its level with a binary search, so the index costs
//! O(#levels) in the worst case and the buckets stay O(1).

use std::collections::{HashMap, VecDeque};

use crate::tcb::{PRIO_MAX, ThreadId};

#[derive(Debug, Clone)]
pub struct PriorityQueue {
    buckets: Vec<VecDeque<ThreadId>>,
    /// Levels in descending order; may contain emptied levels.
    levels: VecDeque<u8>,
    queued: HashMap<ThreadId, u8>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self {
            buckets: vec![VecDeque::new(); usize::from(PRIO_MAX) + 1],
            levels: VecDeque::new(),
            queued: HashMap::new(),
        }
    }
}

impl PriorityQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `id` behind every thread of the same priority. Returns false
    /// if `id` is already queued (the caller treats that as corruption).
    pub fn insert_tail(&mut self, id: ThreadId, priority: u8) -> bool {
        self.insert(id, priority, false)
    }

    /// Queues `id` ahead of every thread of the same priority.
    pub fn insert_head(&mut self, id: ThreadId, priority: u8) -> bool {
        self.insert(id, priority, true)
    }

    fn insert(&mut self, id: ThreadId, priority: u8, head: bool) -> bool {
        let priority = priority.min(PRIO_MAX);
        if self.queued.contains_key(&id) {
            return false;
        }
        let bucket = &mut self.buckets[usize::from(priority)];
        if bucket.is_empty() {
            // Descending order: find the first level lower than ours.
            let position = self.levels.partition_point(|&level| level > priority);
            if self.levels.get(position) != Some(&priority) {
                self.levels.insert(position, priority);
            }
        }
        if head {
            bucket.push_front(id);
        } else {
            bucket.push_back(id);
        }
        self.queued.insert(id, priority);
        true
    }

    pub fn remove(&mut self, id: ThreadId) -> bool {
        let Some(priority) = self.queued.remove(&id) else {
            return false;
        };
        let bucket = &mut self.buckets[usize::from(priority)];
        if let Some(position) = bucket.iter().position(|&queued| queued == id) {
            bucket.remove(position);
        }
        true
    }

    /// Highest-priority thread, FIFO within its level.
    pub fn first(&mut self) -> Option<ThreadId> {
        while let Some(&level) = self.levels.front() {
            if let Some(&id) = self.buckets[usize::from(level)].front() {
                return Some(id);
            }
            self.levels.pop_front();
        }
        None
    }

    /// Priority of [`first`](Self::first) without cleaning the index.
    #[must_use]
    pub fn first_priority(&self) -> Option<u8> {
        self.levels
            .iter()
            .copied()
            .find(|&level| !self.buckets[usize::from(level)].is_empty())
    }

    pub fn pop(&mut self) -> Option<ThreadId> {
        let id = self.first()?;
        self.remove(id);
        Some(id)
    }

    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.queued.contains_key(&id)
    }

    #[must_use]
    pub fn priority_of(&self, id: ThreadId) -> Option<u8> {
        self.queued.get(&id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Threads in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        (0..=PRIO_MAX)
            .rev()
            .flat_map(move |level| self.buckets[usize::from(level)].iter().copied())
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.levels.clear();
        self.queued.clear();
    }
}
