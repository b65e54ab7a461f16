//! LRU-K-like buffer pool with a young/old region split (spec §4.3).
//!
//! A page newly admitted enters the old region at its MRU end. It is
//! promoted to the young region only if accessed again after residing in
//! old for at least `old_block_time_ms`. Victim selection walks the old
//! LRU tail first (falling back to young) skipping pinned frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, Result};
use crate::page::{Page, PageId};
use crate::storage::DiskManager;
use crate::wal::WalManager;

type FrameId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Region {
    Young,
    Old,
}

struct Frame {
    page: RwLock<Option<Page>>,
    pin_count: AtomicUsize,
    dirty: AtomicBool,
    /// Millisecond timestamp (monotonic, relative to pool creation) of entry
    /// into the old region; used to enforce the promotion delay.
    old_since_ms: AtomicI64,
}

impl Frame {
    fn empty() -> Self {
        Self {
            page: RwLock::new(None),
            pin_count: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            old_since_ms: AtomicI64::new(0),
        }
    }
}

pub struct BufferPoolConfig {
    pub num_frames: usize,
    pub young_ratio: f64,
    pub old_block_time_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
}

pub struct BufferPool {
    frames: Vec<Frame>,
    page_table: DashMap<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    young: Mutex<VecDeque<FrameId>>,
    old: Mutex<VecDeque<FrameId>>,
    regions: Vec<Mutex<Region>>,
    young_capacity: usize,
    old_block_time_ms: u64,
    start: Instant,
    disk: Arc<DiskManager>,
    wal: Arc<WalManager>,
    stats: RwLock<BufferPoolStats>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>, wal: Arc<WalManager>) -> Self {
        let num_frames = config.num_frames;
        let young_capacity =
            ((num_frames as f64) * config.young_ratio).round().max(1.0) as usize;
        let mut frames = Vec::with_capacity(num_frames);
        let mut free_list = VecDeque::with_capacity(num_frames);
        let mut regions = Vec::with_capacity(num_frames);
        for i in 0..num_frames {
            frames.push(Frame::empty());
            free_list.push_back(i);
            regions.push(Mutex::new(Region::Old));
        }
        Self {
            frames,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            young: Mutex::new(VecDeque::new()),
            old: Mutex::new(VecDeque::new()),
            regions,
            young_capacity,
            old_block_time_ms: config.old_block_time_ms,
            start: Instant::now(),
            disk,
            wal,
            stats: RwLock::new(BufferPoolStats::default()),
        }
    }

    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Fetch and pin a page, loading it from disk on a cache miss.
    pub fn fetch(self: &Arc<Self>, page_id: PageId) -> Result<PinGuard> {
        if let Some(entry) = self.page_table.get(&page_id) {
            let frame_id = *entry;
            drop(entry);
            self.pin(frame_id);
            self.record_access(frame_id);
            self.stats.write().hits += 1;
            return Ok(PinGuard {
                pool: Arc::clone(self),
                frame_id,
                page_id,
                mark_dirty_on_drop: false,
            });
        }

        self.stats.write().misses += 1;
        let frame_id = self.acquire_frame()?;
        let page = self.disk.read_page(page_id)?;
        *self.frames[frame_id].page.write() = Some(page);
        self.frames[frame_id].dirty.store(false, Ordering::Release);
        self.page_table.insert(page_id, frame_id);
        self.admit_to_old(frame_id);
        self.pin(frame_id);

        Ok(PinGuard {
            pool: Arc::clone(self),
            frame_id,
            page_id,
            mark_dirty_on_drop: false,
        })
    }

    /// Fetch and pin a page, first checking an externally-supplied
    /// cancellation flag (spec §5 "Cancellation"). `canceled` is typically
    /// `LockManager::is_canceled(txn_id)` evaluated by the caller, since
    /// the pool itself has no notion of transactions.
    pub fn fetch_checked(self: &Arc<Self>, page_id: PageId, canceled: bool) -> Result<PinGuard> {
        if canceled {
            return Err(EngineError::Canceled);
        }
        self.fetch(page_id)
    }

    /// Allocate a new page on disk and pin it.
    pub fn new_page(self: &Arc<Self>) -> Result<PinGuard> {
        let page_id = self.disk.allocate_page()?;
        let frame_id = self.acquire_frame()?;
        *self.frames[frame_id].page.write() = Some(Page::new(page_id));
        self.frames[frame_id].dirty.store(true, Ordering::Release);
        self.page_table.insert(page_id, frame_id);
        self.admit_to_old(frame_id);
        self.pin(frame_id);

        Ok(PinGuard {
            pool: Arc::clone(self),
            frame_id,
            page_id,
            mark_dirty_on_drop: false,
        })
    }

    fn pin(&self, frame_id: FrameId) {
        self.frames[frame_id].pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self, frame_id: FrameId, mark_dirty: bool) {
        if mark_dirty {
            self.frames[frame_id].dirty.store(true, Ordering::Release);
        }
        self.frames[frame_id].pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn admit_to_old(&self, frame_id: FrameId) {
        *self.regions[frame_id].lock() = Region::Old;
        self.frames[frame_id].old_since_ms.store(self.now_ms(), Ordering::Release);
        self.old.lock().push_back(frame_id);
    }

    fn record_access(&self, frame_id: FrameId) {
        let region = *self.regions[frame_id].lock();
        match region {
            Region::Young => {
                let mut young = self.young.lock();
                if let Some(pos) = young.iter().position(|f| *f == frame_id) {
                    young.remove(pos);
                }
                young.push_back(frame_id);
            }
            Region::Old => {
                let since = self.frames[frame_id].old_since_ms.load(Ordering::Acquire);
                let eligible = self.now_ms() - since >= self.old_block_time_ms as i64;
                let mut old = self.old.lock();
                if let Some(pos) = old.iter().position(|f| *f == frame_id) {
                    old.remove(pos);
                }
                if eligible {
                    self.promote(frame_id);
                } else {
                    old.push_back(frame_id);
                }
            }
        }
    }

    fn promote(&self, frame_id: FrameId) {
        *self.regions[frame_id].lock() = Region::Young;
        self.stats.write().promotions += 1;
        let mut young = self.young.lock();
        young.push_back(frame_id);
        drop(young);
        self.trim_young();
    }

    /// Keep the young region within its capacity, demoting its LRU end back
    /// to the old region's MRU end.
    fn trim_young(&self) {
        loop {
            let mut young = self.young.lock();
            if young.len() <= self.young_capacity {
                return;
            }
            let Some(demote) = young.pop_front() else {
                return;
            };
            drop(young);
            *self.regions[demote].lock() = Region::Old;
            self.frames[demote]
                .old_since_ms
                .store(self.now_ms(), Ordering::Release);
            self.old.lock().push_back(demote);
        }
    }

    /// Acquire a free or victim frame. Free list first, then the old LRU
    /// tail skipping pinned frames, falling back to the young LRU tail if
    /// every old frame is pinned.
    fn acquire_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        if let Some(victim) = self.evict_from(&self.old) {
            return Ok(victim);
        }
        if let Some(victim) = self.evict_from(&self.young) {
            return Ok(victim);
        }

        Err(EngineError::BufferPoolExhausted(self.frames.len()))
    }

    fn evict_from(&self, list: &Mutex<VecDeque<FrameId>>) -> Option<FrameId> {
        let mut queue = list.lock();
        let len = queue.len();
        for _ in 0..len {
            let Some(candidate) = queue.pop_front() else {
                break;
            };
            if self.frames[candidate].pin_count.load(Ordering::Acquire) > 0 {
                queue.push_back(candidate);
                continue;
            }
            drop(queue);
            if self.evict_frame(candidate).is_ok() {
                self.stats.write().evictions += 1;
                return Some(candidate);
            }
            return None;
        }
        None
    }

    fn evict_frame(&self, frame_id: FrameId) -> Result<()> {
        if self.frames[frame_id].dirty.load(Ordering::Acquire) {
            self.flush_frame(frame_id)?;
        }
        let mut slot = self.frames[frame_id].page.write();
        if let Some(page) = slot.take() {
            self.page_table.remove(&page.page_id());
        }
        Ok(())
    }

    fn flush_frame(&self, frame_id: FrameId) -> Result<()> {
        let mut slot = self.frames[frame_id].page.write();
        if let Some(page) = slot.as_mut() {
            if self.frames[frame_id].dirty.load(Ordering::Acquire) {
                // WAL rule: the log covering this page's last mutation must
                // be durable before the page itself reaches disk.
                self.wal.flush_up_to(page.page_lsn())?;
                page.refresh_checksum();
                self.disk.write_page(page)?;
                self.frames[frame_id].dirty.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Write a page to disk if dirty; does not evict.
    pub fn flush(&self, page_id: PageId) -> Result<()> {
        if let Some(entry) = self.page_table.get(&page_id) {
            let frame_id = *entry;
            drop(entry);
            self.flush_frame(frame_id)?;
        }
        Ok(())
    }

    /// Flush every dirty frame; used at checkpoint.
    pub fn flush_all(&self) -> Result<()> {
        for frame_id in 0..self.frames.len() {
            self.flush_frame(frame_id)?;
        }
        self.disk.sync()
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.stats.read().clone()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.dirty.load(Ordering::Acquire))
            .count()
    }
}

/// RAII pin: releases the pin (and optionally marks the page dirty) when
/// dropped, on every exit path.
pub struct PinGuard {
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
    mark_dirty_on_drop: bool,
}

impl PinGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn mark_dirty(&mut self) {
        self.mark_dirty_on_drop = true;
    }

    pub fn with_page<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let guard = self.pool.frames[self.frame_id].page.read();
        f(guard.as_ref().expect("pinned frame holds a page"))
    }

    pub fn with_page_mut<R>(&mut self, f: impl FnOnce(&mut Page) -> R) -> R {
        self.mark_dirty_on_drop = true;
        let mut guard = self.pool.frames[self.frame_id].page.write();
        f(guard.as_mut().expect("pinned frame holds a page"))
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_id, self.mark_dirty_on_drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsyncPolicy;
    use crate::wal::WalConfig;

    fn make_pool(num_frames: usize) -> (Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("t.cdb"), FsyncPolicy::Fsync).unwrap());
        let wal = Arc::new(
            WalManager::open(dir.path().join("t.wal"), WalConfig::default()).unwrap(),
        );
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames,
                young_ratio: 0.625,
                old_block_time_ms: 0,
            },
            disk,
            wal,
        ));
        (pool, dir)
    }

    #[test]
    fn new_page_then_fetch_roundtrips() {
        let (pool, _dir) = make_pool(4);
        let mut guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        guard.with_page_mut(|p| {
            p.insert_row(b"hi").unwrap();
        });
        drop(guard);
        pool.flush(page_id).unwrap();

        let guard2 = pool.fetch(page_id).unwrap();
        guard2.with_page(|p| assert_eq!(p.read_row(0).unwrap(), b"hi"));
    }

    #[test]
    fn exhausted_pool_returns_error_when_all_pinned() {
        let (pool, _dir) = make_pool(2);
        let _g1 = pool.new_page().unwrap();
        let _g2 = pool.new_page().unwrap();
        assert!(matches!(
            pool.new_page(),
            Err(EngineError::BufferPoolExhausted(2))
        ));
    }

    #[test]
    fn eviction_writes_dirty_page_before_reuse() {
        let (pool, _dir) = make_pool(1);
        let mut g1 = pool.new_page().unwrap();
        let id1 = g1.page_id();
        g1.with_page_mut(|p| {
            p.insert_row(b"first").unwrap();
        });
        drop(g1);

        // Only one frame: allocating a second page must evict the first,
        // flushing it to disk first since it's dirty.
        let g2 = pool.new_page().unwrap();
        drop(g2);

        let reread = pool.fetch(id1).unwrap();
        reread.with_page(|p| assert_eq!(p.read_row(0).unwrap(), b"first"));
    }
}
