//! Undo Log (C5): append-only, random-read file of pre-images for MVCC
//! version reconstruction and transaction rollback.
//!
//! File layout: a 64-byte header (`CYSCALEDB_UNDO` magic + version) followed
//! by length-prefixed records. A stable file offset (`UndoPtr`) identifies
//! each record; records are backward-linked per transaction via
//! `prev_undo_ptr`.

mod cache;
mod record;

pub use record::{UndoKind, UndoRecord};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::txn::TransactionId;
use crate::wal::Lsn;
use cache::DecodeCache;

pub type UndoPtr = u64;

const MAGIC: &[u8; 14] = b"CYSCALEDB_UNDO";
const HEADER_SIZE: u64 = 64;
const FORMAT_VERSION: u32 = 1;

struct Inner {
    file: File,
    tail: u64,
}

pub struct UndoLog {
    inner: Mutex<Inner>,
    cache: Mutex<DecodeCache>,
}

impl UndoLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let tail = if is_new {
            write_header(&mut file)?;
            HEADER_SIZE
        } else {
            verify_header(&mut file)?;
            file.metadata()?.len()
        };

        tracing::debug!(path = %path.display(), tail, "undo log opened");
        Ok(Self {
            inner: Mutex::new(Inner { file, tail }),
            cache: Mutex::new(DecodeCache::new(1024)),
        })
    }

    /// Append a record and return the stable file offset it was written
    /// at, for use as the transaction's new `last_undo_ptr`.
    pub fn write(&self, record: &UndoRecord) -> Result<UndoPtr> {
        let bytes = record.encode();
        let mut inner = self.inner.lock();
        let ptr = inner.tail;
        inner.file.seek(SeekFrom::Start(ptr))?;
        inner.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        inner.file.write_all(&bytes)?;
        inner.tail = ptr + 4 + bytes.len() as u64;
        Ok(ptr)
    }

    /// Decode the record at `ptr`, consulting the bounded LRU cache first.
    pub fn read(&self, ptr: UndoPtr) -> Result<Option<UndoRecord>> {
        if let Some(cached) = self.cache.lock().get(ptr) {
            return Ok(Some(cached));
        }
        let mut inner = self.inner.lock();
        if ptr >= inner.tail {
            return Ok(None);
        }
        inner.file.seek(SeekFrom::Start(ptr))?;
        let mut len_buf = [0u8; 4];
        inner.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        inner.file.read_exact(&mut buf)?;
        drop(inner);

        let record = UndoRecord::decode(&buf)?;
        self.cache.lock().put(ptr, record.clone());
        Ok(Some(record))
    }

    /// Forward scan of every record in the file, used by recovery's
    /// Analysis pass to rebuild each transaction's `last_undo_ptr` (the
    /// last occurrence of a txn id in file order is its current head).
    pub fn scan_all(&self) -> Result<Vec<(UndoPtr, UndoRecord)>> {
        let mut inner = self.inner.lock();
        let tail = inner.tail;
        inner.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut out = Vec::new();
        let mut pos = HEADER_SIZE;
        while pos < tail {
            let mut len_buf = [0u8; 4];
            inner.file.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            inner.file.read_exact(&mut buf)?;
            let record = UndoRecord::decode(&buf)?;
            out.push((pos, record));
            pos += 4 + len as u64;
        }
        Ok(out)
    }

    /// Walk the chain backward from `head_ptr` while each record's
    /// `txn_id` matches, used by MVCC version reconstruction.
    pub fn read_txn_chain(
        &self,
        head_ptr: UndoPtr,
        txn_id: TransactionId,
    ) -> Result<Vec<UndoRecord>> {
        let mut out = Vec::new();
        let mut cursor = Some(head_ptr);
        while let Some(ptr) = cursor {
            let Some(record) = self.read(ptr)? else {
                break;
            };
            if record.txn_id != txn_id {
                break;
            }
            cursor = record.prev_undo_ptr;
            out.push(record);
        }
        Ok(out)
    }

    /// Earliest `redo_lsn` among records belonging to any of `active`, used
    /// to bound WAL truncation at a checkpoint (spec §4.9 step 5): the log
    /// must not be cut past a still-open transaction's oldest logged change.
    pub fn oldest_redo_lsn_for(&self, active: &std::collections::BTreeSet<TransactionId>) -> Result<Option<Lsn>> {
        if active.is_empty() {
            return Ok(None);
        }
        let mut oldest = None;
        for (_, record) in self.scan_all()? {
            if active.contains(&record.txn_id) {
                oldest = Some(oldest.map_or(record.redo_lsn, |o: Lsn| o.min(record.redo_lsn)));
            }
        }
        Ok(oldest)
    }

    /// Conservative purge contract (spec §4.5): a record is eligible once
    /// its `txn_id < min_active_txn` and no live ReadView's active set
    /// contains it. This first cut is a no-op — callers must not assume
    /// space is reclaimed — but it never reclaims a record a live view
    /// could still need.
    pub fn purge_eligible(
        &self,
        record: &UndoRecord,
        min_active_txn: TransactionId,
        still_referenced: impl Fn(TransactionId) -> bool,
    ) -> bool {
        record.txn_id < min_active_txn && !still_referenced(record.txn_id)
    }
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = vec![0u8; HEADER_SIZE as usize];
    header[0..14].copy_from_slice(MAGIC);
    header[14..18].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    let created_at_ticks = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    header[18..26].copy_from_slice(&created_at_ticks.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn verify_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if &header[0..14] != MAGIC {
        return Err(EngineError::Recovery("undo log magic mismatch".into()));
    }
    Ok(())
}

#[allow(dead_code)]
fn redo_lsn_of(record: &UndoRecord) -> Lsn {
    record.redo_lsn
}
