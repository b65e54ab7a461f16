//! Write-Ahead Log (C4): append-only redo log, LSN allocation, segment
//! rotation, checksum, truncation.
//!
//! Wire format per record: `[len:u32 le | payload | checksum:u32 le]`.
//! The payload begins with the record's own LSN so a reader can validate
//! ordering without depending on file position alone.

mod record;
mod segment;

pub use record::LogRecord;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::txn::TransactionId;
use segment::Segment;

pub type Lsn = u64;

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub segment_bytes: u64,
    pub sync_after_write: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 16 * 1024 * 1024,
            sync_after_write: true,
        }
    }
}

struct Inner {
    segments: VecDeque<Segment>,
    current_size: u64,
    next_lsn: Lsn,
}

/// Single writer lock around the log tail; readers (recovery, `read_from`)
/// open independent file handles onto the same segment files. The LSN
/// counter lives inside `inner` so assignment and the write it orders are
/// one atomic step under the writer lock (spec §5).
pub struct WalManager {
    dir: PathBuf,
    base_name: String,
    config: WalConfig,
    flushed_lsn: AtomicU64,
    inner: Mutex<Inner>,
}

impl WalManager {
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let base_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cyscaledb.wal".to_string());

        let existing = segment::discover(&dir, &base_name)?;
        let (segments, max_lsn) = if existing.is_empty() {
            let seg = Segment::create(&dir, &base_name, 0)?;
            (VecDeque::from([seg]), 0)
        } else {
            Segment::open_all(existing)?
        };

        let current_size = segments.back().map(|s| s.len()).unwrap_or(0);
        tracing::debug!(dir = %dir.display(), segments = segments.len(), max_lsn, "wal opened");

        Ok(Self {
            dir,
            base_name,
            config,
            flushed_lsn: AtomicU64::new(max_lsn),
            inner: Mutex::new(Inner {
                segments,
                current_size,
                next_lsn: max_lsn + 1,
            }),
        })
    }

    fn encode(lsn: Lsn, txn_id: Option<TransactionId>, record: &LogRecord) -> Vec<u8> {
        let payload = record.encode(lsn, txn_id);
        let checksum = crc32fast::hash(&payload);
        let mut out = Vec::with_capacity(4 + payload.len() + 4);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Assign the next LSN and append under the writer lock, in one
    /// critical section (spec §5: "LSN is assigned inside that lock") so
    /// file order always tracks LSN order.
    pub fn append(&self, txn_id: Option<TransactionId>, record: LogRecord) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        self.append_raw_locked(&mut inner, lsn, txn_id, &record)?;
        let needs_sync = self.config.sync_after_write || matches!(record, LogRecord::Commit);
        drop(inner);

        if needs_sync {
            self.flush_up_to(lsn)?;
        }
        Ok(lsn)
    }

    /// Append a batch of records under a single contiguous LSN run and a
    /// single acquisition of the writer lock (spec §4.6 MTR/commit path;
    /// spec §5 requires one writer critical section per batch, not one per
    /// entry, so a batch can never interleave with a concurrent `append`).
    /// Returns the LSNs assigned, in order.
    pub fn append_batch(
        &self,
        entries: &[(Option<TransactionId>, LogRecord)],
    ) -> Result<Vec<Lsn>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock();
        let first = inner.next_lsn;
        inner.next_lsn += entries.len() as u64;
        let mut lsns = Vec::with_capacity(entries.len());
        let mut needs_sync = false;
        for (i, (txn_id, record)) in entries.iter().enumerate() {
            let lsn = first + i as u64;
            self.append_raw_locked(&mut inner, lsn, *txn_id, record)?;
            needs_sync |= self.config.sync_after_write || matches!(record, LogRecord::Commit);
            lsns.push(lsn);
        }
        drop(inner);

        if needs_sync {
            self.flush_up_to(first + entries.len() as u64 - 1)?;
        }
        Ok(lsns)
    }

    fn append_raw_locked(
        &self,
        inner: &mut Inner,
        lsn: Lsn,
        txn_id: Option<TransactionId>,
        record: &LogRecord,
    ) -> Result<()> {
        let bytes = Self::encode(lsn, txn_id, record);
        if inner.current_size + bytes.len() as u64 > self.config.segment_bytes {
            self.rotate_locked(inner)?;
        }
        let seg = inner.segments.back_mut().expect("at least one segment");
        seg.append(&bytes)?;
        inner.current_size += bytes.len() as u64;
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut Inner) -> Result<()> {
        let next_index = inner
            .segments
            .back()
            .map(|s| s.index() + 1)
            .unwrap_or(0);
        inner
            .segments
            .back_mut()
            .expect("segment before rotate")
            .sync()?;
        let seg = Segment::create(&self.dir, &self.base_name, next_index)?;
        tracing::debug!(index = next_index, "wal segment rotated");
        inner.segments.push_back(seg);
        inner.current_size = 0;
        Ok(())
    }

    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.rotate_locked(&mut inner)
    }

    /// Ensure all records up to `lsn` are fsynced. No-ops if already
    /// flushed at least that far.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        if self.flushed_lsn.load(Ordering::Acquire) >= lsn {
            return Ok(());
        }
        let inner = self.inner.lock();
        if let Some(seg) = inner.segments.back() {
            seg.sync()?;
        }
        drop(inner);
        self.flushed_lsn.fetch_max(lsn, Ordering::AcqRel);
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::Acquire)
    }

    pub fn next_lsn_peek(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Iterate durable records from `from_lsn` onward for recovery.
    /// Stops at the first record that fails its checksum, treating it as
    /// the (possibly torn) log tail.
    pub fn read_from(&self, from_lsn: Lsn) -> Result<Vec<(Lsn, Option<TransactionId>, LogRecord)>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        'segments: for seg in inner.segments.iter() {
            for raw in seg.read_all()? {
                match LogRecord::decode(&raw) {
                    Ok((lsn, txn_id, record)) => {
                        if lsn >= from_lsn {
                            out.push((lsn, txn_id, record));
                        }
                    }
                    Err(_) => break 'segments,
                }
            }
        }
        Ok(out)
    }

    /// Delete segments strictly before `before_lsn`. Caller is responsible
    /// for ensuring no active transaction still needs those records.
    pub fn truncate(&self, before_lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.segments.len() > 1 {
            let oldest = inner.segments.front().expect("non-empty");
            if oldest.max_lsn_hint() < before_lsn {
                let seg = inner.segments.pop_front().expect("checked front");
                seg.delete()?;
            } else {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> WalManager {
        WalManager::open(
            dir.join("cyscaledb.wal"),
            WalConfig {
                segment_bytes: 16 * 1024 * 1024,
                sync_after_write: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn lsns_are_strictly_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path());
        let lsn1 = wal.append(Some(1), LogRecord::Begin).unwrap();
        let lsn2 = wal.append(Some(1), LogRecord::Commit).unwrap();
        assert_eq!(lsn2, lsn1 + 1);
    }

    #[test]
    fn read_from_returns_appended_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(Some(1), LogRecord::Begin).unwrap();
        wal.append(
            Some(1),
            LogRecord::Insert {
                page_id: 0,
                slot: 0,
                new_bytes: vec![1, 2, 3],
            },
        )
        .unwrap();
        wal.append(Some(1), LogRecord::Commit).unwrap();

        let entries = wal.read_from(0).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0].2, LogRecord::Begin));
        assert!(matches!(entries[2].2, LogRecord::Commit));
    }

    #[test]
    fn flush_up_to_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path());
        let lsn = wal.append(Some(1), LogRecord::Begin).unwrap();
        wal.flush_up_to(lsn).unwrap();
        wal.flush_up_to(lsn).unwrap();
        assert_eq!(wal.flushed_lsn(), lsn);
    }

    #[test]
    fn commit_record_is_always_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(Some(1), LogRecord::Begin).unwrap();
        let commit_lsn = wal.append(Some(1), LogRecord::Commit).unwrap();
        assert_eq!(wal.flushed_lsn(), commit_lsn);
    }

    #[test]
    fn reopen_resumes_lsn_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyscaledb.wal");
        let last_lsn = {
            let wal = WalManager::open(&path, WalConfig::default()).unwrap();
            wal.append(Some(1), LogRecord::Begin).unwrap();
            wal.append(Some(1), LogRecord::Commit).unwrap()
        };
        let wal = WalManager::open(&path, WalConfig::default()).unwrap();
        let next = wal.append(Some(2), LogRecord::Begin).unwrap();
        assert_eq!(next, last_lsn + 1);
    }

    #[test]
    fn truncate_removes_old_segments_only() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalManager::open(
            dir.path().join("cyscaledb.wal"),
            WalConfig {
                segment_bytes: 64,
                sync_after_write: false,
            },
        )
        .unwrap();
        for _ in 0..20 {
            wal.append(
                Some(1),
                LogRecord::Insert {
                    page_id: 0,
                    slot: 0,
                    new_bytes: vec![0; 16],
                },
            )
            .unwrap();
        }
        let before = wal.segment_count();
        assert!(before > 1, "expected rotation to have occurred");
        wal.truncate(wal.next_lsn_peek()).unwrap();
        let after = wal.segment_count();
        assert!(after < before);
        assert!(after >= 1);
    }
}
