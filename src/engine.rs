//! Storage engine (spec §6 "storage engine ↔ executor" contract): the
//! single entry point tying C1-C9 together. SQL parsing, planning, and
//! catalog management are external collaborators; this type only knows
//! about table ids, row ids, and read views.
//!
//! **Row versioning.** Each page slot holds `[creator_txn:u64 |
//! deleted:u8 | has_roll_ptr:u8 | roll_ptr:u64 | row bytes]`. `roll_ptr`
//! points at an undo record whose payload is the *entire* previous
//! versioned slot, so [`StorageEngine::get`] walks it exactly as spec
//! §4.8 describes: "the storage layer ... walks the undo chain until the
//! visible version". This is a separate chain from the transaction-level
//! undo chain ([`crate::txn::Transaction::last_undo_ptr`]) used for
//! rollback, which links a transaction's *own* records together instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferPool, BufferPoolConfig};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lock::{LockKey, LockManager, LockManagerConfig, LockMode};
use crate::mtr::MiniTransaction;
use crate::page::{PageId, Row, RowId};
use crate::recovery::{self, CheckpointManager, RecoveryManager};
use crate::storage::{DiskManager, FsyncPolicy};
use crate::txn::{IsolationLevel, ReadView, TransactionId, TransactionManager};
use crate::undo::{UndoKind, UndoLog, UndoPtr, UndoRecord};
use crate::wal::{LogRecord, WalConfig, WalManager};

struct VersionedRow {
    creator_txn: TransactionId,
    deleted: bool,
    roll_ptr: Option<UndoPtr>,
    row: Row,
}

impl VersionedRow {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + 32);
        buf.extend_from_slice(&self.creator_txn.to_le_bytes());
        buf.push(self.deleted as u8);
        buf.push(self.roll_ptr.is_some() as u8);
        buf.extend_from_slice(&self.roll_ptr.unwrap_or(0).to_le_bytes());
        buf.extend_from_slice(&self.row.encode());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 18 {
            return Err(EngineError::Serialization("truncated row version header".into()));
        }
        let creator_txn = TransactionId::from_le_bytes(bytes[0..8].try_into().unwrap());
        let deleted = bytes[8] != 0;
        let has_roll_ptr = bytes[9] != 0;
        let roll_ptr_raw = u64::from_le_bytes(bytes[10..18].try_into().unwrap());
        let roll_ptr = has_roll_ptr.then_some(roll_ptr_raw);
        let row = Row::decode(&bytes[18..])?;
        Ok(Self {
            creator_txn,
            deleted,
            roll_ptr,
            row,
        })
    }
}

pub struct StorageEngine {
    data_dir: PathBuf,
    wal: Arc<WalManager>,
    undo: Arc<UndoLog>,
    pool: Arc<BufferPool>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
    recovery: Arc<RecoveryManager>,
    checkpoint_manager: Arc<CheckpointManager>,
    deadlock_check_interval: std::time::Duration,
    /// Last page each table appended to, so inserts pack rows onto an
    /// existing page before allocating a fresh one.
    insert_pages: Mutex<HashMap<u32, PageId>>,
}

impl StorageEngine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let wal = Arc::new(WalManager::open(
            data_dir.join("cyscaledb.wal"),
            WalConfig {
                segment_bytes: config.wal_segment_bytes,
                sync_after_write: config.wal_sync_after_write,
            },
        )?);
        let undo = Arc::new(UndoLog::open(data_dir.join("cyscaledb.undo"))?);
        let disk = Arc::new(DiskManager::open(
            data_dir.join("main.cdb"),
            if config.enable_doublewrite {
                FsyncPolicy::Fsync
            } else {
                FsyncPolicy::Fdatasync
            },
        )?);
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: config.buffer_pool_pages,
                young_ratio: config.buffer_pool_young_ratio,
                old_block_time_ms: config.old_block_time_ms,
            },
            disk,
            Arc::clone(&wal),
        ));
        let lock_manager = Arc::new(LockManager::new(LockManagerConfig {
            wait_timeout: config.lock_wait_timeout(),
        }));
        let txn_manager = Arc::new(TransactionManager::new(
            Arc::clone(&wal),
            Arc::clone(&lock_manager),
            config.default_isolation_level,
        ));
        let recovery_manager = Arc::new(RecoveryManager::new(
            Arc::clone(&wal),
            Arc::clone(&undo),
            Arc::clone(&pool),
        ));
        let checkpoint_manager = Arc::new(CheckpointManager::new(
            Arc::clone(&wal),
            Arc::clone(&pool),
            Arc::clone(&txn_manager),
            Arc::clone(&undo),
            data_dir.join("checkpoint.meta"),
        ));

        let engine = Self {
            data_dir,
            wal,
            undo,
            pool,
            lock_manager,
            txn_manager,
            recovery: recovery_manager,
            checkpoint_manager,
            deadlock_check_interval: config.deadlock_check_interval(),
            insert_pages: Mutex::new(HashMap::new()),
        };
        engine.run_recovery()?;
        Ok(engine)
    }

    fn run_recovery(&self) -> Result<()> {
        let checkpoint = recovery::read_checkpoint(&self.data_dir.join("checkpoint.meta"))?;
        let from_lsn = checkpoint.as_ref().map(|c| c.checkpoint_lsn).unwrap_or(0);
        let analysis = self.recovery.analyze(checkpoint.as_ref())?;
        self.txn_manager.fast_forward_id(analysis.next_txn_id);
        let applied = self.recovery.redo(from_lsn)?;
        tracing::info!(applied, "recovery redo pass complete");

        let losers = analysis.losers();
        if !losers.is_empty() {
            let pool = Arc::clone(&self.pool);
            self.recovery
                .undo_losers(&losers, &analysis.last_undo_ptr, move |record| {
                    Self::reverse_undo_record(&pool, record)
                })?;
            tracing::info!(count = losers.len(), "recovery undo pass rolled back losers");
        }
        Ok(())
    }

    fn reverse_undo_record(pool: &Arc<BufferPool>, record: &UndoRecord) -> Result<()> {
        let mut guard = pool.fetch(record.row_id.page_id)?;
        match record.kind {
            UndoKind::Insert => {
                guard.with_page_mut(|p| p.delete_row(record.row_id.slot))?;
            }
            UndoKind::Update | UndoKind::Delete => {
                guard.with_page_mut(|p| p.update_row_in_place(record.row_id.slot, &record.payload))?;
            }
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.checkpoint_manager.run().map(|_| ())
    }

    /// Reject new writes once a prior commit's WAL write has failed (spec
    /// §7); the engine stays degraded until the process restarts.
    fn check_not_degraded(&self) -> Result<()> {
        if self.txn_manager.is_degraded() {
            return Err(EngineError::Degraded);
        }
        Ok(())
    }

    /// Request cooperative cancellation of `txn_id` (spec §5
    /// "Cancellation"): any `acquire`/`acquire_gap` it is blocked on, or
    /// later calls into, returns `Canceled` instead of granting or
    /// completing.
    pub fn cancel(&self, txn_id: TransactionId) -> Result<()> {
        self.txn_manager.get(txn_id)?;
        self.lock_manager.request_cancel(txn_id);
        Ok(())
    }

    /// Drive `LockManager::sweep_for_deadlocks` on `deadlock_check_interval_ms`
    /// (spec §9), aborting each victim it selects, until `shutdown` resolves.
    /// Same shape as `CheckpointManager::run_periodic`: intended to be
    /// spawned as a `tokio` task by the process embedding this engine.
    pub async fn run_deadlock_sweep(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.deadlock_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for victim in self.lock_manager.sweep_for_deadlocks() {
                        match self.rollback(victim) {
                            Ok(()) => tracing::info!(txn = victim, "aborted deadlock victim via periodic sweep"),
                            Err(e) => tracing::warn!(txn = victim, error = %e, "failed to abort deadlock victim"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub fn begin(&self, isolation: Option<IsolationLevel>) -> Result<TransactionId> {
        self.txn_manager.begin(isolation)
    }

    pub fn commit(&self, txn_id: TransactionId) -> Result<()> {
        self.txn_manager.commit(txn_id)
    }

    pub fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        let undo = Arc::clone(&self.undo);
        self.txn_manager.rollback(txn_id, move |ptr| {
            let Some(record) = undo.read(ptr)? else {
                return Ok(None);
            };
            Self::reverse_undo_record(&pool, &record)?;
            Ok(record.prev_undo_ptr)
        })
    }

    pub fn get_read_view(&self, txn_id: TransactionId) -> Result<ReadView> {
        self.txn_manager.get_or_create_read_view(txn_id)
    }

    /// Return a page with room for `needed` bytes for `table_id`, reusing
    /// the table's last-appended page when it still has space and falling
    /// back to a fresh allocation otherwise.
    fn page_for_insert(&self, table_id: u32, needed: usize) -> Result<PageId> {
        let current = self.insert_pages.lock().get(&table_id).copied();
        if let Some(page_id) = current {
            let has_space = self.pool.fetch(page_id)?.with_page(|p| p.free_space() >= needed + 4);
            if has_space {
                return Ok(page_id);
            }
        }
        let guard = self.pool.new_page()?;
        let page_id = guard.page_id();
        drop(guard);
        self.insert_pages.lock().insert(table_id, page_id);
        Ok(page_id)
    }

    /// Insert a row into `table_id`, returning its stable [`RowId`].
    /// Acquires a table IX lock then a row X lock, writes undo before
    /// redo, and dirties the page inside one MTR.
    pub fn insert_row(&self, txn_id: TransactionId, table_id: u32, row: &Row) -> Result<RowId> {
        self.check_not_degraded()?;
        self.lock_manager
            .acquire(txn_id, LockKey::Table(table_id), LockMode::IX)?;

        let versioned = VersionedRow {
            creator_txn: txn_id,
            deleted: false,
            roll_ptr: None,
            row: row.clone(),
        }
        .encode();

        let page_id = self.page_for_insert(table_id, versioned.len())?;
        let mut mtr = MiniTransaction::begin(Arc::clone(&self.pool), Arc::clone(&self.wal), Some(txn_id));
        let slot = mtr.with_page_mut(page_id, |p| p.insert_row(&versioned))??;
        let row_id = RowId::new(page_id, slot);

        self.lock_manager
            .acquire(txn_id, LockKey::Row(table_id, row_id), LockMode::X)?;

        let undo_ptr = self.undo.write(&UndoRecord {
            kind: UndoKind::Insert,
            txn_id,
            table_id,
            row_id,
            prev_undo_ptr: self.txn_manager.get(txn_id)?.last_undo_ptr,
            payload: Vec::new(),
            redo_lsn: self.wal.next_lsn_peek(),
        })?;
        self.txn_manager.record_undo(txn_id, undo_ptr)?;

        mtr.record(
            page_id,
            LogRecord::Insert {
                page_id,
                slot,
                new_bytes: versioned,
            },
        );
        mtr.commit(false)?;

        Ok(row_id)
    }

    /// Read a row as of `read_view`, walking the roll-pointer chain to an
    /// older version if the page's current version is not visible.
    pub fn get(&self, row_id: RowId, read_view: &ReadView) -> Result<Option<Row>> {
        let guard = self
            .pool
            .fetch_checked(row_id.page_id, self.lock_manager.is_canceled(read_view.creator_txn))?;
        let Ok(bytes) = guard.with_page(|p| p.read_row(row_id.slot).map(|b| b.to_vec())) else {
            return Ok(None);
        };
        drop(guard);

        let mut current = VersionedRow::decode(&bytes)?;
        loop {
            if read_view.is_visible(current.creator_txn) {
                return Ok((!current.deleted).then_some(current.row));
            }
            let Some(ptr) = current.roll_ptr else {
                return Ok(None);
            };
            let Some(record) = self.undo.read(ptr)? else {
                return Ok(None);
            };
            if record.payload.is_empty() {
                // An Insert undo record: no earlier version exists.
                return Ok(None);
            }
            current = VersionedRow::decode(&record.payload)?;
        }
    }

    /// Update a row in place, returning the [`RowId`] it ends up at. That
    /// is almost always `row_id` unchanged; [`crate::page::Page::update_row_in_place`]
    /// only grows a payload within its own page's free space, so when the
    /// new row doesn't fit there this falls back to the same delete+insert
    /// a caller would otherwise have to orchestrate itself, migrating the
    /// row onto whatever page has room (spec §4.1). Any index entry keyed
    /// on the old `RowId` is the caller's responsibility to repoint.
    pub fn update_row(&self, txn_id: TransactionId, table_id: u32, row_id: RowId, new_row: &Row) -> Result<RowId> {
        self.check_not_degraded()?;
        self.lock_manager
            .acquire(txn_id, LockKey::Row(table_id, row_id), LockMode::X)?;

        let mut mtr = MiniTransaction::begin(Arc::clone(&self.pool), Arc::clone(&self.wal), Some(txn_id));
        let old_bytes = mtr
            .with_page_mut(row_id.page_id, |p| p.read_row(row_id.slot).map(|b| b.to_vec()))?
            .map_err(|_| EngineError::SlotNotFound(row_id))?;

        let undo_ptr = self.undo.write(&UndoRecord {
            kind: UndoKind::Update,
            txn_id,
            table_id,
            row_id,
            prev_undo_ptr: self.txn_manager.get(txn_id)?.last_undo_ptr,
            payload: old_bytes,
            redo_lsn: self.wal.next_lsn_peek(),
        })?;
        self.txn_manager.record_undo(txn_id, undo_ptr)?;

        let versioned = VersionedRow {
            creator_txn: txn_id,
            deleted: false,
            roll_ptr: Some(undo_ptr),
            row: new_row.clone(),
        }
        .encode();

        match mtr.with_page_mut(row_id.page_id, |p| p.update_row_in_place(row_id.slot, &versioned))? {
            Ok(()) => {
                mtr.record(
                    row_id.page_id,
                    LogRecord::Update {
                        page_id: row_id.page_id,
                        slot: row_id.slot,
                        old_bytes: Vec::new(),
                        new_bytes: versioned,
                    },
                );
                mtr.commit(false)?;
                Ok(row_id)
            }
            Err(EngineError::NoSpace { .. }) => {
                self.migrate_row(txn_id, table_id, row_id, undo_ptr, new_row, mtr)
            }
            Err(e) => Err(e),
        }
    }

    /// Finish an update that didn't fit on its own page: tombstone the old
    /// slot (pointing MVCC readers back through `undo_ptr` at the
    /// pre-image, same as a logical delete) and insert the new content
    /// fresh on another page, all inside `mtr` so both sides land
    /// atomically. Mirrors `insert_row`/`delete_row`'s own undo/redo shape.
    fn migrate_row(
        &self,
        txn_id: TransactionId,
        table_id: u32,
        old_row_id: RowId,
        undo_ptr: UndoPtr,
        new_row: &Row,
        mut mtr: MiniTransaction,
    ) -> Result<RowId> {
        let marker = VersionedRow {
            creator_txn: txn_id,
            deleted: true,
            roll_ptr: Some(undo_ptr),
            row: Row::default(),
        }
        .encode();
        mtr.with_page_mut(old_row_id.page_id, |p| p.update_row_in_place(old_row_id.slot, &marker))??;
        mtr.record(
            old_row_id.page_id,
            LogRecord::Delete {
                page_id: old_row_id.page_id,
                slot: old_row_id.slot,
                old_bytes: Vec::new(),
            },
        );

        let new_versioned = VersionedRow {
            creator_txn: txn_id,
            deleted: false,
            roll_ptr: None,
            row: new_row.clone(),
        }
        .encode();
        let new_page_id = self.page_for_insert(table_id, new_versioned.len())?;
        let slot = mtr.with_page_mut(new_page_id, |p| p.insert_row(&new_versioned))??;
        let new_row_id = RowId::new(new_page_id, slot);

        self.lock_manager
            .acquire(txn_id, LockKey::Row(table_id, new_row_id), LockMode::X)?;

        let insert_undo_ptr = self.undo.write(&UndoRecord {
            kind: UndoKind::Insert,
            txn_id,
            table_id,
            row_id: new_row_id,
            prev_undo_ptr: self.txn_manager.get(txn_id)?.last_undo_ptr,
            payload: Vec::new(),
            redo_lsn: self.wal.next_lsn_peek(),
        })?;
        self.txn_manager.record_undo(txn_id, insert_undo_ptr)?;

        mtr.record(
            new_page_id,
            LogRecord::Insert {
                page_id: new_page_id,
                slot,
                new_bytes: new_versioned,
            },
        );
        mtr.commit(false)?;

        tracing::debug!(txn = txn_id, ?old_row_id, ?new_row_id, "update migrated row to a new page");
        Ok(new_row_id)
    }

    pub fn delete_row(&self, txn_id: TransactionId, table_id: u32, row_id: RowId) -> Result<()> {
        self.check_not_degraded()?;
        self.lock_manager
            .acquire(txn_id, LockKey::Row(table_id, row_id), LockMode::X)?;

        let mut mtr = MiniTransaction::begin(Arc::clone(&self.pool), Arc::clone(&self.wal), Some(txn_id));
        let old_bytes = mtr
            .with_page_mut(row_id.page_id, |p| p.read_row(row_id.slot).map(|b| b.to_vec()))?
            .map_err(|_| EngineError::SlotNotFound(row_id))?;

        let undo_ptr = self.undo.write(&UndoRecord {
            kind: UndoKind::Delete,
            txn_id,
            table_id,
            row_id,
            prev_undo_ptr: self.txn_manager.get(txn_id)?.last_undo_ptr,
            payload: old_bytes,
            redo_lsn: self.wal.next_lsn_peek(),
        })?;
        self.txn_manager.record_undo(txn_id, undo_ptr)?;

        // Delete-mark in place rather than tombstoning the slot outright,
        // so MVCC readers holding an older view can still roll back to
        // the pre-delete version via the roll pointer.
        let marker = VersionedRow {
            creator_txn: txn_id,
            deleted: true,
            roll_ptr: Some(undo_ptr),
            row: Row::default(),
        }
        .encode();
        mtr.with_page_mut(row_id.page_id, |p| p.update_row_in_place(row_id.slot, &marker))??;

        mtr.record(
            row_id.page_id,
            LogRecord::Delete {
                page_id: row_id.page_id,
                slot: row_id.slot,
                old_bytes: Vec::new(),
            },
        );
        mtr.commit(false)?;
        Ok(())
    }

    /// Scan every visible row on `page_id` as of `read_view`. Real
    /// multi-page table scans are a catalog/index concern and out of
    /// scope here; this exposes the page-at-a-time primitive the executor
    /// composes into a full scan.
    pub fn scan_page(&self, page_id: PageId, read_view: &ReadView) -> Result<Vec<(RowId, Row)>> {
        let slot_count = {
            let guard = self.pool.fetch(page_id)?;
            guard.with_page(|p| p.slot_count())
        };
        let mut out = Vec::new();
        for slot in 0..slot_count {
            let row_id = RowId::new(page_id, slot);
            if let Some(row) = self.get(row_id, read_view)? {
                out.push((row_id, row));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::DataValue;

    fn open(dir: &std::path::Path) -> StorageEngine {
        StorageEngine::open(EngineConfig {
            data_dir: dir.to_string_lossy().into_owned(),
            buffer_pool_pages: 32,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    fn text_row(s: &str) -> Row {
        Row::new(vec![DataValue::Text(s.to_string())])
    }

    #[test]
    fn insert_then_get_is_visible_to_own_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let txn = engine.begin(None).unwrap();
        let row_id = engine.insert_row(txn, 1, &text_row("alice")).unwrap();

        let view = engine.get_read_view(txn).unwrap();
        let row = engine.get(row_id, &view).unwrap().unwrap();
        assert_eq!(row, text_row("alice"));
    }

    #[test]
    fn uncommitted_insert_is_invisible_to_other_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let writer = engine.begin(None).unwrap();
        let row_id = engine.insert_row(writer, 1, &text_row("bob")).unwrap();

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert!(engine.get(row_id, &view).unwrap().is_none());
    }

    #[test]
    fn committed_insert_becomes_visible_to_new_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let writer = engine.begin(None).unwrap();
        let row_id = engine.insert_row(writer, 1, &text_row("carol")).unwrap();
        engine.commit(writer).unwrap();

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert_eq!(engine.get(row_id, &view).unwrap().unwrap(), text_row("carol"));
    }

    #[test]
    fn repeatable_read_sees_pre_update_version_via_roll_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let writer = engine.begin(None).unwrap();
        let row_id = engine.insert_row(writer, 1, &text_row("v1")).unwrap();
        engine.commit(writer).unwrap();

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();

        let updater = engine.begin(None).unwrap();
        engine.update_row(updater, 1, row_id, &text_row("v2")).unwrap();
        engine.commit(updater).unwrap();

        // reader's repeatable-read view was taken before the update committed.
        assert_eq!(engine.get(row_id, &view).unwrap().unwrap(), text_row("v1"));

        let fresh = engine.begin(None).unwrap();
        let fresh_view = engine.get_read_view(fresh).unwrap();
        assert_eq!(engine.get(row_id, &fresh_view).unwrap().unwrap(), text_row("v2"));
    }

    #[test]
    fn update_migrates_to_another_page_when_growth_does_not_fit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());

        let setup = engine.begin(None).unwrap();
        let target = engine.insert_row(setup, 1, &text_row("tiny")).unwrap();
        // Pack the rest of the page so the later growth has nowhere to go.
        loop {
            let filler = text_row(&"x".repeat(1500));
            let page_id = engine.page_for_insert(1, VersionedRow {
                creator_txn: setup,
                deleted: false,
                roll_ptr: None,
                row: filler.clone(),
            }.encode().len()).unwrap();
            if page_id != target.page_id {
                break;
            }
            engine.insert_row(setup, 1, &filler).unwrap();
        }
        engine.commit(setup).unwrap();

        let updater = engine.begin(None).unwrap();
        let big = text_row(&"y".repeat(3000));
        let new_row_id = engine.update_row(updater, 1, target, &big).unwrap();
        engine.commit(updater).unwrap();

        assert_ne!(new_row_id, target, "growth should have migrated to a new page");

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert!(engine.get(target, &view).unwrap().is_none());
        assert_eq!(engine.get(new_row_id, &view).unwrap().unwrap(), big);
    }

    #[test]
    fn rollback_restores_pre_insert_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let txn = engine.begin(None).unwrap();
        let row_id = engine.insert_row(txn, 1, &text_row("doomed")).unwrap();
        engine.rollback(txn).unwrap();

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert!(engine.get(row_id, &view).unwrap().is_none());
    }

    #[test]
    fn delete_is_invisible_but_prior_version_survives_for_older_view() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let writer = engine.begin(None).unwrap();
        let row_id = engine.insert_row(writer, 1, &text_row("to-delete")).unwrap();
        engine.commit(writer).unwrap();

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();

        let deleter = engine.begin(None).unwrap();
        engine.delete_row(deleter, 1, row_id).unwrap();
        engine.commit(deleter).unwrap();

        assert_eq!(engine.get(row_id, &view).unwrap().unwrap(), text_row("to-delete"));

        let fresh = engine.begin(None).unwrap();
        let fresh_view = engine.get_read_view(fresh).unwrap();
        assert!(engine.get(row_id, &fresh_view).unwrap().is_none());
    }

    #[test]
    fn scan_page_returns_only_visible_rows() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let txn = engine.begin(None).unwrap();
        let r1 = engine.insert_row(txn, 1, &text_row("a")).unwrap();
        let r2 = engine.insert_row(txn, 1, &text_row("b")).unwrap();
        engine.commit(txn).unwrap();
        assert_eq!(r1.page_id, r2.page_id);

        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        let rows = engine.scan_page(r1.page_id, &view).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn recovery_replays_committed_insert_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let row_id = {
            let engine = open(&data_dir);
            let txn = engine.begin(None).unwrap();
            let row_id = engine.insert_row(txn, 1, &text_row("durable")).unwrap();
            engine.commit(txn).unwrap();
            row_id
        };

        let engine = open(&data_dir);
        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert_eq!(engine.get(row_id, &view).unwrap().unwrap(), text_row("durable"));
    }

    #[test]
    fn recovery_rolls_back_uncommitted_insert_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let row_id = {
            let engine = open(&data_dir);
            let txn = engine.begin(None).unwrap();
            engine.insert_row(txn, 1, &text_row("never-committed")).unwrap()
            // engine dropped here with `txn` still active: simulates a crash
            // mid-transaction. No Commit record ever reached the WAL.
        };

        let engine = open(&data_dir);
        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert!(
            engine.get(row_id, &view).unwrap().is_none(),
            "analysis must mark the crashed transaction a loser and undo its insert"
        );
    }

    #[test]
    fn committed_work_survives_a_checkpoint_and_later_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let (before_checkpoint, after_checkpoint) = {
            let engine = open(&data_dir);
            let txn = engine.begin(None).unwrap();
            let before = engine.insert_row(txn, 1, &text_row("before-checkpoint")).unwrap();
            engine.commit(txn).unwrap();

            engine.checkpoint().unwrap();

            let txn = engine.begin(None).unwrap();
            let after = engine.insert_row(txn, 1, &text_row("after-checkpoint")).unwrap();
            engine.commit(txn).unwrap();
            (before, after)
        };

        let engine = open(&data_dir);
        let reader = engine.begin(None).unwrap();
        let view = engine.get_read_view(reader).unwrap();
        assert_eq!(
            engine.get(before_checkpoint, &view).unwrap().unwrap(),
            text_row("before-checkpoint")
        );
        assert_eq!(
            engine.get(after_checkpoint, &view).unwrap().unwrap(),
            text_row("after-checkpoint")
        );
        assert!(dir.path().join("checkpoint.meta").exists());
    }

    #[test]
    fn crossing_row_locks_between_two_transactions_reports_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(open(dir.path()));

        let setup_txn = engine.begin(None).unwrap();
        let row_a = engine.insert_row(setup_txn, 1, &text_row("a")).unwrap();
        let row_b = engine.insert_row(setup_txn, 1, &text_row("b")).unwrap();
        engine.commit(setup_txn).unwrap();

        let txn1 = engine.begin(None).unwrap();
        let txn2 = engine.begin(None).unwrap();
        engine.update_row(txn1, 1, row_a, &text_row("a1")).unwrap();
        engine.update_row(txn2, 1, row_b, &text_row("b1")).unwrap();

        let waiter = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.update_row(txn1, 1, row_b, &text_row("a2")))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));

        let err = engine
            .update_row(txn2, 1, row_a, &text_row("b2"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Deadlock(_)));

        engine.rollback(txn2).unwrap();
        assert!(waiter.join().unwrap().is_ok());
        engine.commit(txn1).unwrap();
    }

    #[tokio::test]
    async fn periodic_deadlock_sweep_runs_alongside_normal_lock_waits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(open(dir.path()));

        let setup_txn = engine.begin(None).unwrap();
        let row_a = engine.insert_row(setup_txn, 1, &text_row("a")).unwrap();
        let row_b = engine.insert_row(setup_txn, 1, &text_row("b")).unwrap();
        engine.commit(setup_txn).unwrap();

        let txn1 = engine.begin(None).unwrap();
        let txn2 = engine.begin(None).unwrap();
        engine.update_row(txn1, 1, row_a, &text_row("a1")).unwrap();
        engine.update_row(txn2, 1, row_b, &text_row("b1")).unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let sweep = tokio::spawn(Arc::clone(&engine).run_deadlock_sweep(shutdown_rx));

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || engine.update_row(txn1, 1, row_b, &text_row("a2")))
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = engine
            .update_row(txn2, 1, row_a, &text_row("b2"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Deadlock(_)));

        engine.rollback(txn2).unwrap();
        assert!(waiter.await.unwrap().is_ok());
        engine.commit(txn1).unwrap();

        shutdown_tx.send(true).unwrap();
        sweep.await.unwrap();
    }

    #[test]
    fn canceling_a_blocked_transaction_unblocks_it_with_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(open(dir.path()));

        let setup_txn = engine.begin(None).unwrap();
        let row_a = engine.insert_row(setup_txn, 1, &text_row("a")).unwrap();
        engine.commit(setup_txn).unwrap();

        let holder = engine.begin(None).unwrap();
        engine.update_row(holder, 1, row_a, &text_row("held")).unwrap();

        let waiter_txn = engine.begin(None).unwrap();
        let waiter = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.update_row(waiter_txn, 1, row_a, &text_row("blocked")))
        };
        std::thread::sleep(std::time::Duration::from_millis(30));

        engine.cancel(waiter_txn).unwrap();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Canceled));

        engine.commit(holder).unwrap();
    }

    #[test]
    fn canceled_transaction_is_rejected_on_next_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());

        let txn = engine.begin(None).unwrap();
        engine.cancel(txn).unwrap();
        let err = engine.insert_row(txn, 1, &text_row("x")).unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
    }
}
