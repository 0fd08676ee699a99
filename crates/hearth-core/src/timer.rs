// src/timer.rs
//
// Idle-connection timers: an array-backed binary min-heap keyed on
// absolute expiration seconds. Touched only by the dispatcher thread,
// so no locking.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One timer: when it fires and which connection it belongs to. The
/// generation guards against slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub expire: u64,
    pub slot: usize,
    pub generation: u32,
}

#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerEntry>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek(&self) -> Option<&TimerEntry> {
        self.heap.first()
    }

    pub fn insert(&mut self, entry: TimerEntry) {
        self.heap.push(entry);
        self.sift_up(self.heap.len() - 1);
    }

    /// Remove the timer for `(slot, generation)`. Linear find, logarithmic fix.
    pub fn remove(&mut self, slot: usize, generation: u32) -> bool {
        match self.find(slot, generation) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Push a live connection's expiration out to `expire`, restoring
    /// heap order from the touched slot in both directions.
    pub fn adjust(&mut self, slot: usize, generation: u32, expire: u64) -> bool {
        match self.find(slot, generation) {
            Some(index) => {
                self.heap[index].expire = expire;
                self.sift_down(index);
                self.sift_up(index);
                true
            }
            None => false,
        }
    }

    /// Pop every timer with `expire <= now` in ascending expiration
    /// order, handing each to `expired`.
    pub fn tick<F: FnMut(TimerEntry)>(&mut self, now: u64, mut expired: F) {
        while let Some(root) = self.heap.first().copied() {
            if root.expire > now {
                break;
            }
            self.remove_at(0);
            expired(root);
        }
    }

    fn find(&self, slot: usize, generation: u32) -> Option<usize> {
        self.heap
            .iter()
            .position(|e| e.slot == slot && e.generation == generation)
    }

    fn remove_at(&mut self, index: usize) {
        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        self.heap.pop();
        if index < self.heap.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[parent].expire <= self.heap[index].expire {
                break;
            }
            self.heap.swap(parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = index * 2 + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap[right].expire < self.heap[left].expire {
                smallest = right;
            }
            if self.heap[index].expire <= self.heap[smallest].expire {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }

    #[cfg(test)]
    fn is_min_heap(&self) -> bool {
        (1..self.heap.len()).all(|i| self.heap[(i - 1) / 2].expire <= self.heap[i].expire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slot: usize, expire: u64) -> TimerEntry {
        TimerEntry {
            expire,
            slot,
            generation: 1,
        }
    }

    fn heap_of(expirations: &[u64]) -> TimerHeap {
        let mut heap = TimerHeap::new();
        for (slot, &expire) in expirations.iter().enumerate() {
            heap.insert(entry(slot, expire));
            assert!(heap.is_min_heap());
        }
        heap
    }

    #[test]
    fn insert_keeps_the_heap_property() {
        let heap = heap_of(&[9, 3, 7, 1, 8, 2, 6, 4, 5, 0]);
        assert_eq!(heap.peek().unwrap().expire, 0);
        assert!(heap.is_min_heap());
    }

    #[test]
    fn remove_by_identity() {
        let mut heap = heap_of(&[5, 1, 9, 3, 7]);
        assert!(heap.remove(2, 1)); // the slot holding expire=9
        assert!(!heap.remove(2, 1));
        assert!(!heap.remove(2, 2)); // wrong generation
        assert!(heap.is_min_heap());
        assert_eq!(heap.len(), 4);
    }

    #[test]
    fn remove_from_the_middle_restores_order() {
        // Removal swaps with the last element; the replacement may need
        // to move either direction.
        for victim in 0..8 {
            let mut heap = heap_of(&[4, 10, 5, 30, 20, 8, 6, 40]);
            assert!(heap.remove(victim, 1));
            assert!(heap.is_min_heap(), "after removing slot {}", victim);
        }
    }

    #[test]
    fn adjust_pushes_a_timer_out() {
        let mut heap = heap_of(&[2, 5, 8]);
        assert!(heap.adjust(0, 1, 99));
        assert!(heap.is_min_heap());
        assert_eq!(heap.peek().unwrap().expire, 5);
        assert!(!heap.adjust(9, 1, 10));
    }

    #[test]
    fn tick_expires_exactly_the_due_set_in_order() {
        let mut heap = heap_of(&[15, 3, 11, 7, 30, 5]);
        let mut fired = Vec::new();
        heap.tick(11, |e| fired.push(e));

        assert_eq!(
            fired.iter().map(|e| e.expire).collect::<Vec<_>>(),
            vec![3, 5, 7, 11]
        );
        assert_eq!(heap.len(), 2);
        assert!(heap.is_min_heap());
        // The survivors are untouched.
        let mut remaining: Vec<u64> = Vec::new();
        heap.tick(u64::MAX, |e| remaining.push(e.expire));
        assert_eq!(remaining, vec![15, 30]);
    }

    #[test]
    fn tick_on_an_empty_heap_is_a_no_op() {
        let mut heap = TimerHeap::new();
        heap.tick(100, |_| panic!("nothing should fire"));
    }

    #[test]
    fn equal_expirations_all_fire() {
        let mut heap = heap_of(&[4, 4, 4, 9]);
        let mut count = 0;
        heap.tick(4, |_| count += 1);
        assert_eq!(count, 3);
        assert_eq!(heap.len(), 1);
    }
}
