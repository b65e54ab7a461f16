//! Gap locks: key-range locks over `[low, high]` on a named index, stored
//! in a per-index interval structure (spec §4.7).
//!
//! A gap lock conflicts with another transaction's overlapping gap lock
//! only when at least one side requests `X`. Lookup is `O(log n + k)`: a
//! `BTreeMap` keyed on the range's low bound narrows to candidates whose
//! low bound is at or before the requested high bound, then each is
//! checked for actual overlap.

use std::collections::{BTreeMap, HashSet};

use super::mode::LockMode;
use crate::txn::TransactionId;

#[derive(Debug, Clone, Copy)]
struct GapEntry {
    high: i64,
    txn_id: TransactionId,
    mode: LockMode,
}

#[derive(Default)]
pub struct GapIndex {
    by_low: BTreeMap<i64, Vec<GapEntry>>,
}

impl GapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions holding a gap lock on `[low, high]` that conflicts with
    /// `txn_id` requesting `mode`. Empty means the request can be granted.
    pub fn conflicting_holders(
        &self,
        low: i64,
        high: i64,
        txn_id: TransactionId,
        mode: LockMode,
    ) -> HashSet<TransactionId> {
        let mut holders = HashSet::new();
        for (_, entries) in self.by_low.range(..=high) {
            for entry in entries {
                if entry.txn_id == txn_id {
                    continue;
                }
                let overlaps = entry.high >= low;
                let either_exclusive = mode == LockMode::X || entry.mode == LockMode::X;
                if overlaps && either_exclusive {
                    holders.insert(entry.txn_id);
                }
            }
        }
        holders
    }

    #[cfg(test)]
    fn conflicts(&self, low: i64, high: i64, txn_id: TransactionId, mode: LockMode) -> bool {
        !self.conflicting_holders(low, high, txn_id, mode).is_empty()
    }

    pub fn insert(&mut self, low: i64, high: i64, txn_id: TransactionId, mode: LockMode) {
        self.by_low.entry(low).or_default().push(GapEntry {
            high,
            txn_id,
            mode,
        });
    }

    pub fn release_all(&mut self, txn_id: TransactionId) {
        self.by_low.retain(|_, entries| {
            entries.retain(|e| e.txn_id != txn_id);
            !entries.is_empty()
        });
    }
}
