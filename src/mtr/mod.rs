//! Mini-Transaction (C6): groups page mutations that must be atomic with
//! respect to crash recovery (e.g. a B-tree split or directory rewrite).
//!
//! MTRs are short-lived and single-threaded; they do not nest re-entrantly.
//! On first touch of a page the MTR snapshots its bytes for local rollback,
//! distinct from the transaction-level undo log in [`crate::undo`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{BufferPool, PinGuard};
use crate::error::Result;
use crate::page::{Page, PageId};
use crate::txn::TransactionId;
use crate::wal::{LogRecord, Lsn, WalManager};

struct Touched {
    guard: PinGuard,
    pre_image: Box<[u8; crate::page::PAGE_SIZE]>,
    redo: Vec<LogRecord>,
}

pub struct MiniTransaction {
    pool: Arc<BufferPool>,
    wal: Arc<WalManager>,
    txn_id: Option<TransactionId>,
    touched: HashMap<PageId, Touched>,
}

impl MiniTransaction {
    pub fn begin(pool: Arc<BufferPool>, wal: Arc<WalManager>, txn_id: Option<TransactionId>) -> Self {
        Self {
            pool,
            wal,
            txn_id,
            touched: HashMap::new(),
        }
    }

    /// Pin `page_id` (or reuse the pin from an earlier touch this MTR),
    /// capturing its pre-image the first time, and apply `f` to it. The
    /// caller records the matching redo entry via [`Self::record`]
    /// afterward.
    pub fn with_page_mut<R>(&mut self, page_id: PageId, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        if !self.touched.contains_key(&page_id) {
            let guard = self.pool.fetch(page_id)?;
            let pre_image = guard.with_page(|p| Box::new(*p.as_bytes()));
            self.touched.insert(
                page_id,
                Touched {
                    guard,
                    pre_image,
                    redo: Vec::new(),
                },
            );
        }
        let entry = self.touched.get_mut(&page_id).expect("just inserted");
        Ok(entry.guard.with_page_mut(f))
    }

    /// Buffer a redo entry for a page already touched in this MTR.
    pub fn record(&mut self, page_id: PageId, record: LogRecord) {
        if let Some(entry) = self.touched.get_mut(&page_id) {
            entry.redo.push(record);
        }
    }

    /// Write all buffered redo records to WAL under one contiguous LSN
    /// run, stamp each touched page's `page_lsn`, mark them dirty, and
    /// optionally force durability before returning.
    pub fn commit(mut self, force_durable: bool) -> Result<Vec<Lsn>> {
        let mut entries = Vec::new();
        let mut page_order = Vec::new();
        for (page_id, touched) in self.touched.iter() {
            for record in &touched.redo {
                entries.push((self.txn_id, record.clone()));
                page_order.push(*page_id);
            }
        }

        let lsns = self.wal.append_batch(&entries)?;

        let mut last_lsn_per_page: HashMap<PageId, Lsn> = HashMap::new();
        for (page_id, lsn) in page_order.iter().zip(lsns.iter()) {
            last_lsn_per_page.insert(*page_id, *lsn);
        }

        for (page_id, touched) in self.touched.iter_mut() {
            if let Some(&lsn) = last_lsn_per_page.get(page_id) {
                touched.guard.with_page_mut(|p| p.set_page_lsn(lsn));
            }
        }

        if force_durable {
            if let Some(max_lsn) = lsns.iter().max() {
                self.wal.flush_up_to(*max_lsn)?;
            }
        }

        Ok(lsns)
    }

    /// Restore every touched page to its first-touch pre-image. No WAL
    /// record is emitted.
    pub fn abort(mut self) -> Result<()> {
        for (page_id, touched) in self.touched.iter_mut() {
            let restored = Page::from_bytes(*touched.pre_image.clone());
            touched.guard.with_page_mut(|p| *p = restored);
            tracing::trace!(page_id, "mtr abort restored pre-image");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::storage::{DiskManager, FsyncPolicy};
    use crate::wal::WalConfig;

    fn setup() -> (Arc<BufferPool>, Arc<WalManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("t.cdb"), FsyncPolicy::Fsync).unwrap());
        let wal = Arc::new(WalManager::open(dir.path().join("t.wal"), WalConfig::default()).unwrap());
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 8,
                young_ratio: 0.625,
                old_block_time_ms: 0,
            },
            disk,
            Arc::clone(&wal),
        ));
        (pool, wal, dir)
    }

    #[test]
    fn commit_persists_mutation_and_stamps_lsn() {
        let (pool, wal, _dir) = setup();
        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        drop(guard);

        let mut mtr = MiniTransaction::begin(Arc::clone(&pool), Arc::clone(&wal), Some(1));
        let slot = mtr
            .with_page_mut(page_id, |p| p.insert_row(b"hello"))
            .unwrap()
            .unwrap();
        mtr.record(
            page_id,
            LogRecord::Insert {
                page_id,
                slot,
                new_bytes: b"hello".to_vec(),
            },
        );
        let lsns = mtr.commit(true).unwrap();
        assert_eq!(lsns.len(), 1);

        let guard = pool.fetch(page_id).unwrap();
        guard.with_page(|p| assert_eq!(p.read_row(slot).unwrap(), b"hello"));
    }

    #[test]
    fn abort_restores_pre_image_with_no_wal_record() {
        let (pool, wal, _dir) = setup();
        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        drop(guard);

        let before_lsn = wal.next_lsn_peek();
        let mut mtr = MiniTransaction::begin(Arc::clone(&pool), Arc::clone(&wal), Some(1));
        mtr.with_page_mut(page_id, |p| p.insert_row(b"temp").unwrap())
            .unwrap();
        mtr.abort().unwrap();
        assert_eq!(wal.next_lsn_peek(), before_lsn);

        let guard = pool.fetch(page_id).unwrap();
        guard.with_page(|p| assert_eq!(p.slot_count(), 0));
    }
}
