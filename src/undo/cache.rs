//! Bounded LRU cache of decoded undo records (spec §4.5).

use std::collections::HashMap;
use std::collections::VecDeque;

use super::{UndoPtr, UndoRecord};

pub struct DecodeCache {
    capacity: usize,
    entries: HashMap<UndoPtr, UndoRecord>,
    order: VecDeque<UndoPtr>,
}

impl DecodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, ptr: UndoPtr) -> Option<UndoRecord> {
        self.entries.get(&ptr).cloned()
    }

    pub fn put(&mut self, ptr: UndoPtr, record: UndoRecord) {
        if self.entries.insert(ptr, record).is_none() {
            self.order.push_back(ptr);
            // Eviction is arbitrary within budget (spec §4.5); dropping the
            // oldest insertion is simplest and matches that contract.
            if self.order.len() > self.capacity {
                if let Some(evict) = self.order.pop_front() {
                    self.entries.remove(&evict);
                }
            }
        }
    }
}
