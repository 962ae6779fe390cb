//! Positional binary heaps for task selection.
//!
//! A [`PosHeap`] is a min-heap of `(key, id)` pairs with a position map, so
//! the coordinator can update or delete an entry in place when a tree's
//! generation, pin count, or compaction priority changes. Both scheduler
//! heaps are owned and mutated only by the coordinator thread.

use std::collections::HashMap;

/// Binary min-heap with stable ids and in-place updates.
#[derive(Debug, Default)]
pub struct PosHeap<K: Ord + Clone> {
    entries: Vec<(K, u64)>,
    pos: HashMap<u64, usize>,
}

impl<K: Ord + Clone> PosHeap<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            pos: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pos.contains_key(&id)
    }

    /// The smallest entry, if any.
    pub fn top(&self) -> Option<(&K, u64)> {
        self.entries.first().map(|(k, id)| (k, *id))
    }

    /// Inserts a new entry. Replaces the key when `id` is already present.
    pub fn insert(&mut self, id: u64, key: K) {
        if self.contains(id) {
            self.update(id, key);
            return;
        }
        let at = self.entries.len();
        self.entries.push((key, id));
        self.pos.insert(id, at);
        self.sift_up(at);
    }

    /// Removes an entry by id; returns `false` when absent.
    pub fn remove(&mut self, id: u64) -> bool {
        let Some(at) = self.pos.remove(&id) else {
            return false;
        };
        let last = self.entries.len() - 1;
        if at != last {
            self.entries.swap(at, last);
            self.entries.pop();
            let moved_id = self.entries[at].1;
            self.pos.insert(moved_id, at);
            let at = self.sift_up(at);
            self.sift_down(at);
        } else {
            self.entries.pop();
        }
        true
    }

    /// Updates an entry's key in place, restoring heap order.
    pub fn update(&mut self, id: u64, key: K) {
        let Some(&at) = self.pos.get(&id) else {
            return;
        };
        self.entries[at].0 = key;
        let at = self.sift_up(at);
        self.sift_down(at);
    }

    fn sift_up(&mut self, mut at: usize) -> usize {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.entries[at].0 >= self.entries[parent].0 {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
        at
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            let right = 2 * at + 2;
            let mut smallest = at;
            if left < self.entries.len() && self.entries[left].0 < self.entries[smallest].0 {
                smallest = left;
            }
            if right < self.entries.len() && self.entries[right].0 < self.entries[smallest].0 {
                smallest = right;
            }
            if smallest == at {
                break;
            }
            self.swap(at, smallest);
            at = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.pos.insert(self.entries[a].1, a);
        self.pos.insert(self.entries[b].1, b);
    }
}

// ------------------------------------------------------------------------------------------------
// Heap keys
// ------------------------------------------------------------------------------------------------

/// Dump-heap order: trees not currently dumping first, then lower pin
/// count, then older generation, then secondary indexes before the primary
/// of the same space. Derived `Ord` over the field order gives exactly that
/// precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DumpKey {
    pub is_dumping: bool,
    pub pin_count: u32,
    pub generation: u64,
    pub is_primary: bool,
}

/// Compact-heap order: highest compaction priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompactKey(pub std::cmp::Reverse<usize>);

impl CompactKey {
    pub fn new(priority: usize) -> Self {
        Self(std::cmp::Reverse(priority))
    }

    pub fn priority(&self) -> usize {
        self.0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_top_orders_by_key() {
        let mut heap = PosHeap::new();
        heap.insert(1, 30u64);
        heap.insert(2, 10);
        heap.insert(3, 20);
        assert_eq!(heap.top(), Some((&10, 2)));
        assert!(heap.remove(2));
        assert_eq!(heap.top(), Some((&20, 3)));
        assert!(!heap.remove(2));
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn update_in_place_reorders() {
        let mut heap = PosHeap::new();
        for id in 0..10u64 {
            heap.insert(id, id * 10);
        }
        heap.update(9, 1);
        assert_eq!(heap.top(), Some((&1, 9)));
        heap.update(9, 1000);
        assert_eq!(heap.top(), Some((&0, 0)));
    }

    #[test]
    fn insert_existing_id_updates() {
        let mut heap = PosHeap::new();
        heap.insert(7, 50u64);
        heap.insert(7, 5);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.top(), Some((&5, 7)));
    }

    #[test]
    fn remove_keeps_heap_property() {
        let mut heap = PosHeap::new();
        let keys = [42u64, 7, 19, 3, 88, 21, 64, 11, 2, 55];
        for (id, key) in keys.iter().enumerate() {
            heap.insert(id as u64, *key);
        }
        heap.remove(3);
        heap.remove(8);
        let mut drained = Vec::new();
        while let Some((&key, id)) = heap.top() {
            drained.push(key);
            heap.remove(id);
        }
        let mut expected: Vec<u64> = vec![42, 7, 19, 88, 21, 64, 11, 55];
        expected.sort_unstable();
        assert_eq!(drained, expected);
    }

    #[test]
    fn dump_key_precedence() {
        // Not dumping < dumping, regardless of generation.
        let idle = DumpKey {
            is_dumping: false,
            pin_count: 0,
            generation: 9,
            is_primary: false,
        };
        let busy = DumpKey {
            is_dumping: true,
            pin_count: 0,
            generation: 1,
            is_primary: false,
        };
        assert!(idle < busy);

        // Secondary before primary at equal generation.
        let secondary = DumpKey {
            is_dumping: false,
            pin_count: 0,
            generation: 3,
            is_primary: false,
        };
        let primary = DumpKey {
            is_dumping: false,
            pin_count: 0,
            generation: 3,
            is_primary: true,
        };
        assert!(secondary < primary);

        // Lower pin count first.
        let pinned = DumpKey {
            is_dumping: false,
            pin_count: 1,
            generation: 0,
            is_primary: false,
        };
        assert!(secondary < pinned);
    }
}
