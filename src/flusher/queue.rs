//! Dirty Queue
//!
//! Keys waiting to be flushed, in the order they became dirty. The queue
//! lives under the store's coordination lock; the flusher takes the whole
//! queue in one swap and works on it with the lock released.

use bytes::Bytes;
use std::collections::VecDeque;

/// Keys awaiting flush.
#[derive(Debug, Default, Clone)]
pub struct DirtyQueue {
    keys: VecDeque<Bytes>,
}

impl DirtyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Bytes) {
        self.keys.push_back(key);
    }

    /// Puts keys back at the front, ahead of anything queued since.
    pub fn push_front_all(&mut self, keys: impl DoubleEndedIterator<Item = Bytes>) {
        for key in keys.rev() {
            self.keys.push_front(key);
        }
    }

    /// Removes up to `n` keys from the front.
    pub fn take(&mut self, n: usize) -> Vec<Bytes> {
        let n = n.min(self.keys.len());
        self.keys.drain(..n).collect()
    }

    /// Replaces the queue with an empty one, returning the old contents.
    pub fn swap_out(&mut self) -> DirtyQueue {
        std::mem::take(self)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn drain(&mut self) -> impl DoubleEndedIterator<Item = Bytes> + '_ {
        self.keys.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<Bytes> {
        names.iter().map(|n| Bytes::from(n.to_string())).collect()
    }

    #[test]
    fn test_take_in_batches() {
        let mut queue = DirtyQueue::new();
        for key in keys(&["a", "b", "c"]) {
            queue.push(key);
        }

        assert_eq!(queue.take(2), keys(&["a", "b"]));
        assert_eq!(queue.take(2), keys(&["c"]));
        assert!(queue.take(2).is_empty());
    }

    #[test]
    fn test_swap_out_leaves_empty_queue() {
        let mut queue = DirtyQueue::new();
        queue.push(Bytes::from("a"));

        let mut swapped = queue.swap_out();
        assert!(queue.is_empty());
        assert_eq!(swapped.len(), 1);

        // Producers keep appending to the fresh queue.
        queue.push(Bytes::from("b"));
        assert_eq!(swapped.take(10), keys(&["a"]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_front_all_keeps_order() {
        let mut queue = DirtyQueue::new();
        queue.push(Bytes::from("z"));
        queue.push_front_all(keys(&["a", "b"]).into_iter());
        assert_eq!(queue.take(3), keys(&["a", "b", "z"]));
    }
}
