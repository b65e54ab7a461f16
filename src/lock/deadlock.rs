//! Wait-for graph cycle detection (spec §4.7).
//!
//! The graph is rebuilt from the lock manager's current waiters/holders on
//! every check rather than maintained incrementally — with lock wait
//! durations in the tens of milliseconds to seconds, an O(V+E) DFS per
//! block event is cheap relative to the block itself.

use std::collections::{HashMap, HashSet};

use crate::txn::TransactionId;

pub type WaitForGraph = HashMap<TransactionId, HashSet<TransactionId>>;

/// DFS cycle check starting from `start`, following `waiter -> holder`
/// edges. Returns true iff `start` is part of a cycle (i.e. waiting,
/// transitively, on itself).
pub fn has_cycle_through(graph: &WaitForGraph, start: TransactionId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        let Some(neighbors) = graph.get(&node) else {
            continue;
        };
        for &next in neighbors {
            if next == start {
                return true;
            }
            if visited.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}

/// Enumerate every transaction currently participating in some cycle, for
/// the timer-driven global sweep.
pub fn find_all_in_cycles(graph: &WaitForGraph) -> HashSet<TransactionId> {
    graph
        .keys()
        .copied()
        .filter(|&txn| has_cycle_through(graph, txn))
        .collect()
}

/// Victim selection prefers the youngest transaction (spec §4.7); ids are
/// monotonically increasing, so youngest is the maximum id.
pub fn youngest(txns: impl IntoIterator<Item = TransactionId>) -> Option<TransactionId> {
    txns.into_iter().max()
}
