//! ReadView (spec §3, §4.8 visibility predicate).

use std::collections::BTreeSet;

use super::TransactionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadView {
    pub creator_txn: TransactionId,
    /// Smallest active txn id at view creation.
    pub up_limit: TransactionId,
    /// Next-to-be-assigned txn id at view creation.
    pub low_limit: TransactionId,
    /// Txn ids active at creation, excluding the creator.
    pub active_set: BTreeSet<TransactionId>,
}

impl ReadView {
    /// Whether a row version created by `creator_txn` is visible to this
    /// view (spec §4.8, evaluated in order):
    /// 1. self-created, 2. created before the view's oldest active txn,
    /// 3. created at/after the view's low limit ⇒ invisible,
    /// 4. otherwise visible iff not in the view's active set.
    pub fn is_visible(&self, creator_txn: TransactionId) -> bool {
        if creator_txn == self.creator_txn {
            return true;
        }
        if creator_txn < self.up_limit {
            return true;
        }
        if creator_txn >= self.low_limit {
            return false;
        }
        !self.active_set.contains(&creator_txn)
    }
}
