//! FIFO wait queues of thread handles.
//!
//! Queues hold [`ThreadId`] handles rather than links inside the TCB, so a
//! TCB carries a single `WaitSlot` telling which queue (if any) holds it.

use std::collections::VecDeque;

use crate::tcb::ThreadId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadQueue {
    items: VecDeque<ThreadId>,
}

impl ThreadQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, id: ThreadId) {
        self.items.push_back(id);
    }

    pub fn push_front(&mut self, id: ThreadId) {
        self.items.push_front(id);
    }

    pub fn pop_front(&mut self) -> Option<ThreadId> {
        self.items.pop_front()
    }

    #[must_use]
    pub fn front(&self) -> Option<ThreadId> {
        self.items.front().copied()
    }

    /// Inserts `id` before the first element for which `before` holds,
    /// or at the tail when none does.
    pub fn insert_before(&mut self, id: ThreadId, mut before: impl FnMut(ThreadId) -> bool) {
        let position = self
            .items
            .iter()
            .position(|&queued| before(queued))
            .unwrap_or(self.items.len());
        self.items.insert(position, id);
    }

    /// Unlinks `id`; returns whether it was queued.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        match self.items.iter().position(|&queued| queued == id) {
            Some(position) => {
                self.items.remove(position);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.items.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.items.iter().copied()
    }

    pub fn drain(&mut self) -> Vec<ThreadId> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
