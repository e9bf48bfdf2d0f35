//! Key-unique FIFO queue with in-place update.
//!
//! Elements are enqueued under a key; re-enqueueing an existing key replaces
//! the value while keeping the original queue position, so a newer topology
//! or SME overwrites the queued one without losing its turn.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct UpdatableQueue<K, V> {
    data: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> Default for UpdatableQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> UpdatableQueue<K, V> {
    pub fn new() -> Self {
        UpdatableQueue {
            data: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert or replace the value for `key`. Returns true if the key was
    /// new.
    pub fn enqueue(&mut self, key: K, value: V) -> bool {
        let new = self.data.insert(key.clone(), value).is_none();
        if new {
            self.order.push_back(key);
        }
        new
    }

    /// Remove and return the oldest element.
    pub fn dequeue(&mut self) -> Option<V> {
        let key = self.order.pop_front()?;
        self.data.remove(&key)
    }

    /// Remove and return up to `count` oldest elements.
    pub fn dequeue_up_to(&mut self, count: usize) -> Vec<V> {
        let mut out = Vec::with_capacity(count.min(self.len()));
        for _ in 0..count {
            match self.dequeue() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.data.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = UpdatableQueue::new();
        q.enqueue(1, "a");
        q.enqueue(2, "b");
        q.enqueue(3, "c");
        assert_eq!(q.dequeue(), Some("a"));
        assert_eq!(q.dequeue(), Some("b"));
        assert_eq!(q.dequeue(), Some("c"));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn update_preserves_position() {
        let mut q = UpdatableQueue::new();
        q.enqueue(1, "old");
        q.enqueue(2, "b");
        assert!(!q.enqueue(1, "new"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some("new"));
        assert_eq!(q.dequeue(), Some("b"));
    }

    #[test]
    fn remove_by_key() {
        let mut q = UpdatableQueue::new();
        q.enqueue(1, "a");
        q.enqueue(2, "b");
        assert_eq!(q.remove(&1), Some("a"));
        assert!(!q.contains(&1));
        assert_eq!(q.dequeue(), Some("b"));
    }

    #[test]
    fn dequeue_up_to_stops_at_empty() {
        let mut q = UpdatableQueue::new();
        q.enqueue(1, 10);
        q.enqueue(2, 20);
        assert_eq!(q.dequeue_up_to(5), vec![10, 20]);
        assert!(q.is_empty());
    }
}
