//! Lock Manager (C7): acquisition protocol, wait queues, gap locks, and
//! online + timer-driven deadlock detection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use super::deadlock::{self, WaitForGraph};
use super::gap::GapIndex;
use super::key::LockKey;
use super::mode::LockMode;
use crate::error::{EngineError, Result};
use crate::txn::TransactionId;

#[derive(Default)]
struct LockEntry {
    granted: HashMap<TransactionId, LockMode>,
    waiting: VecDeque<TransactionId>,
}

struct KeyLock {
    mutex: Mutex<LockEntry>,
    condvar: Condvar,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(LockEntry::default()),
            condvar: Condvar::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    pub wait_timeout: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(5000),
        }
    }
}

struct GapLock {
    mutex: Mutex<GapIndex>,
    condvar: Condvar,
}

impl GapLock {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(GapIndex::new()),
            condvar: Condvar::new(),
        }
    }
}

pub struct LockManager {
    entries: DashMap<LockKey, Arc<KeyLock>>,
    gap_indexes: DashMap<u32, Arc<GapLock>>,
    /// Keys held by each transaction, for one-shot release on commit/abort.
    txn_keys: DashMap<TransactionId, Vec<LockKey>>,
    txn_gap_indexes: DashMap<TransactionId, HashSet<u32>>,
    /// waiter -> set of transactions it is currently blocked behind, kept
    /// globally so the deadlock check can see across different keys.
    wait_for: DashMap<TransactionId, HashSet<TransactionId>>,
    /// Transactions with a cancellation requested (spec §5 "Cancellation").
    /// Consulted by `acquire`/`acquire_gap` and surfaced to the buffer pool
    /// via `is_canceled` so callers without their own per-txn state (like
    /// `Transaction`, which is cloned out of its table by value) have one
    /// shared place to ask "has this transaction been asked to stop".
    canceled: DashMap<TransactionId, ()>,
    config: LockManagerConfig,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            gap_indexes: DashMap::new(),
            txn_keys: DashMap::new(),
            txn_gap_indexes: DashMap::new(),
            wait_for: DashMap::new(),
            canceled: DashMap::new(),
            config,
        }
    }

    /// Mark `txn_id` as canceled and wake every waiter so a blocked
    /// `acquire`/`acquire_gap` notices promptly instead of riding out its
    /// full wait timeout.
    pub fn request_cancel(&self, txn_id: TransactionId) {
        self.canceled.insert(txn_id, ());
        for entry in self.entries.iter() {
            entry.value().condvar.notify_all();
        }
        for entry in self.gap_indexes.iter() {
            entry.value().condvar.notify_all();
        }
    }

    pub fn is_canceled(&self, txn_id: TransactionId) -> bool {
        self.canceled.contains_key(&txn_id)
    }

    fn snapshot_wait_for_graph(&self) -> WaitForGraph {
        self.wait_for
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Acquire `mode` on `key` for `txn_id`, following spec §4.7's
    /// three-step protocol: already-covering request returns immediately,
    /// a compatible holder set grants immediately, otherwise the
    /// requester waits for a grant, a deadlock, or a timeout.
    pub fn acquire(&self, txn_id: TransactionId, key: LockKey, mode: LockMode) -> Result<()> {
        if self.is_canceled(txn_id) {
            return Err(EngineError::Canceled);
        }
        let keylock = Arc::clone(
            self.entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyLock::new()))
                .value(),
        );

        let mut guard = keylock.mutex.lock();

        if let Some(&held) = guard.granted.get(&txn_id) {
            if !mode.is_upgrade(held) {
                return Ok(()); // already covers the request
            }
            if guard.granted.len() == 1 {
                guard.granted.insert(txn_id, mode);
                self.record_key(txn_id, key);
                return Ok(());
            }
            // Not the sole holder: fall through and queue like a fresh request.
        }

        if Self::compatible_with_holders(&guard, txn_id, mode) {
            guard.granted.insert(txn_id, mode);
            drop(guard);
            self.record_key(txn_id, key);
            return Ok(());
        }

        let holders: HashSet<TransactionId> = guard
            .granted
            .keys()
            .copied()
            .filter(|&h| h != txn_id)
            .collect();
        self.wait_for.insert(txn_id, holders);
        guard.waiting.push_back(txn_id);

        if deadlock::has_cycle_through(&self.snapshot_wait_for_graph(), txn_id) {
            guard.waiting.retain(|&w| w != txn_id);
            self.wait_for.remove(&txn_id);
            tracing::debug!(txn = txn_id, "online deadlock check rejected acquire");
            return Err(EngineError::Deadlock(txn_id));
        }

        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            if self.is_canceled(txn_id) {
                guard.waiting.retain(|&w| w != txn_id);
                self.wait_for.remove(&txn_id);
                return Err(EngineError::Canceled);
            }

            if Self::compatible_with_holders(&guard, txn_id, mode) {
                guard.granted.insert(txn_id, mode);
                guard.waiting.retain(|&w| w != txn_id);
                self.wait_for.remove(&txn_id);
                drop(guard);
                self.record_key(txn_id, key);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                guard.waiting.retain(|&w| w != txn_id);
                self.wait_for.remove(&txn_id);
                return Err(EngineError::LockTimeout(self.config.wait_timeout.as_millis() as u64));
            }

            let timed_out = keylock
                .condvar
                .wait_for(&mut guard, deadline - now)
                .timed_out();
            if timed_out && !Self::compatible_with_holders(&guard, txn_id, mode) {
                guard.waiting.retain(|&w| w != txn_id);
                self.wait_for.remove(&txn_id);
                return Err(EngineError::LockTimeout(self.config.wait_timeout.as_millis() as u64));
            }
        }
    }

    fn compatible_with_holders(guard: &LockEntry, txn_id: TransactionId, mode: LockMode) -> bool {
        guard
            .granted
            .iter()
            .all(|(&holder, &held)| holder == txn_id || mode.compatible_with(held))
    }

    fn record_key(&self, txn_id: TransactionId, key: LockKey) {
        self.txn_keys.entry(txn_id).or_default().push(key);
    }

    /// Acquire a gap lock on `[low, high]`, following the same
    /// wait/deadlock-check/timeout protocol as `acquire` (spec §4.7
    /// Scenario 5: a conflicting insert blocks behind a held gap lock and
    /// proceeds once it is released, rather than failing immediately).
    pub fn acquire_gap(
        &self,
        txn_id: TransactionId,
        index_id: u32,
        low: i64,
        high: i64,
        mode: LockMode,
    ) -> Result<()> {
        if self.is_canceled(txn_id) {
            return Err(EngineError::Canceled);
        }
        let gaplock = Arc::clone(
            self.gap_indexes
                .entry(index_id)
                .or_insert_with(|| Arc::new(GapLock::new()))
                .value(),
        );

        let mut idx = gaplock.mutex.lock();

        let holders = idx.conflicting_holders(low, high, txn_id, mode);
        if holders.is_empty() {
            idx.insert(low, high, txn_id, mode);
            drop(idx);
            self.record_gap(txn_id, index_id);
            return Ok(());
        }

        self.wait_for.insert(txn_id, holders);

        if deadlock::has_cycle_through(&self.snapshot_wait_for_graph(), txn_id) {
            self.wait_for.remove(&txn_id);
            tracing::debug!(txn = txn_id, "online deadlock check rejected gap acquire");
            return Err(EngineError::Deadlock(txn_id));
        }

        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            if self.is_canceled(txn_id) {
                self.wait_for.remove(&txn_id);
                return Err(EngineError::Canceled);
            }

            let holders = idx.conflicting_holders(low, high, txn_id, mode);
            if holders.is_empty() {
                idx.insert(low, high, txn_id, mode);
                self.wait_for.remove(&txn_id);
                drop(idx);
                self.record_gap(txn_id, index_id);
                return Ok(());
            }
            self.wait_for.insert(txn_id, holders);

            let now = Instant::now();
            if now >= deadline {
                self.wait_for.remove(&txn_id);
                return Err(EngineError::LockTimeout(self.config.wait_timeout.as_millis() as u64));
            }

            let timed_out = gaplock
                .condvar
                .wait_for(&mut idx, deadline - now)
                .timed_out();
            if timed_out && !idx.conflicting_holders(low, high, txn_id, mode).is_empty() {
                self.wait_for.remove(&txn_id);
                return Err(EngineError::LockTimeout(self.config.wait_timeout.as_millis() as u64));
            }
        }
    }

    fn record_gap(&self, txn_id: TransactionId, index_id: u32) {
        self.txn_gap_indexes.entry(txn_id).or_default().insert(index_id);
    }

    /// Drop every lock (point and gap) held by `txn_id` in one pass and
    /// wake waiters on each affected key whose request may now be
    /// grantable.
    pub fn release_all(&self, txn_id: TransactionId) {
        if let Some((_, keys)) = self.txn_keys.remove(&txn_id) {
            for key in keys {
                if let Some(keylock) = self.entries.get(&key) {
                    let mut guard = keylock.mutex.lock();
                    guard.granted.remove(&txn_id);
                    drop(guard);
                    keylock.condvar.notify_all();
                }
            }
        }
        if let Some((_, indexes)) = self.txn_gap_indexes.remove(&txn_id) {
            for index_id in indexes {
                if let Some(gaplock) = self.gap_indexes.get(&index_id) {
                    gaplock.mutex.lock().release_all(txn_id);
                    gaplock.condvar.notify_all();
                }
            }
        }
        self.wait_for.remove(&txn_id);
        self.canceled.remove(&txn_id);
    }

    /// Timer-driven global sweep (spec §4.7): catches cycles that formed
    /// without tripping the online check (e.g. two waiters blocking on
    /// each other's *future* requests). Returns the victims it selected,
    /// one per independent cycle, by youngest-transaction preference; the
    /// caller is responsible for aborting them.
    pub fn sweep_for_deadlocks(&self) -> Vec<TransactionId> {
        let graph = self.snapshot_wait_for_graph();
        let mut in_cycle = deadlock::find_all_in_cycles(&graph);
        let mut victims = Vec::new();
        while !in_cycle.is_empty() {
            let Some(victim) = deadlock::youngest(in_cycle.iter().copied()) else {
                break;
            };
            victims.push(victim);
            in_cycle.remove(&victim);
            in_cycle.retain(|&t| deadlock::has_cycle_through(&graph, t));
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_locks_grant_immediately() {
        let lm = LockManager::new(LockManagerConfig::default());
        lm.acquire(1, LockKey::Table(1), LockMode::S).unwrap();
        lm.acquire(2, LockKey::Table(1), LockMode::S).unwrap();
    }

    #[test]
    fn exclusive_lock_excludes_other_holders() {
        let lm = LockManager::new(LockManagerConfig {
            wait_timeout: Duration::from_millis(50),
        });
        lm.acquire(1, LockKey::Table(1), LockMode::X).unwrap();
        let err = lm.acquire(2, LockKey::Table(1), LockMode::X).unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout(_)));
    }

    #[test]
    fn release_all_wakes_a_waiting_upgrade() {
        let lm = Arc::new(LockManager::new(LockManagerConfig {
            wait_timeout: Duration::from_millis(500),
        }));
        lm.acquire(1, LockKey::Table(1), LockMode::X).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            std::thread::spawn(move || lm.acquire(2, LockKey::Table(1), LockMode::X))
        };
        std::thread::sleep(Duration::from_millis(20));
        lm.release_all(1);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn upgrade_s_to_x_allowed_only_as_sole_holder() {
        let lm = LockManager::new(LockManagerConfig::default());
        lm.acquire(1, LockKey::Table(1), LockMode::S).unwrap();
        lm.acquire(1, LockKey::Table(1), LockMode::X).unwrap();
    }

    #[test]
    fn cyclic_wait_is_detected_online() {
        let lm = Arc::new(LockManager::new(LockManagerConfig {
            wait_timeout: Duration::from_millis(500),
        }));
        lm.acquire(1, LockKey::Table(1), LockMode::X).unwrap();
        lm.acquire(2, LockKey::Table(2), LockMode::X).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || lm2.acquire(1, LockKey::Table(2), LockMode::X));
        std::thread::sleep(Duration::from_millis(50));

        let err = lm.acquire(2, LockKey::Table(1), LockMode::X).unwrap_err();
        assert!(matches!(err, EngineError::Deadlock(_)));
        lm.release_all(1);
        let _ = waiter.join();
    }

    #[test]
    fn gap_lock_conflict_is_reported() {
        let lm = LockManager::new(LockManagerConfig {
            wait_timeout: Duration::from_millis(50),
        });
        lm.acquire_gap(1, 7, 10, 20, LockMode::X).unwrap();
        assert!(lm.acquire_gap(2, 7, 15, 25, LockMode::X).is_err());
    }

    #[test]
    fn canceled_txn_is_rejected_immediately() {
        let lm = LockManager::new(LockManagerConfig::default());
        lm.request_cancel(1);
        let err = lm.acquire(1, LockKey::Table(1), LockMode::X).unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
    }

    #[test]
    fn cancel_wakes_a_blocked_waiter() {
        let lm = Arc::new(LockManager::new(LockManagerConfig {
            wait_timeout: Duration::from_millis(500),
        }));
        lm.acquire(1, LockKey::Table(1), LockMode::X).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            std::thread::spawn(move || lm.acquire(2, LockKey::Table(1), LockMode::X))
        };
        std::thread::sleep(Duration::from_millis(20));
        lm.request_cancel(2);
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
    }

    #[test]
    fn gap_lock_blocks_then_grants_after_release() {
        let lm = Arc::new(LockManager::new(LockManagerConfig {
            wait_timeout: Duration::from_millis(500),
        }));
        lm.acquire_gap(1, 7, 10, 20, LockMode::X).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            std::thread::spawn(move || lm.acquire_gap(2, 7, 15, 25, LockMode::X))
        };
        std::thread::sleep(Duration::from_millis(20));
        lm.release_all(1);
        assert!(waiter.join().unwrap().is_ok());
    }
}
