//! A single WAL segment file plus rotation/discovery helpers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::txn::TransactionId;

use super::record::LogRecord;

pub struct Segment {
    path: PathBuf,
    index: u64,
    file: Mutex<File>,
    len: AtomicU64,
}

fn segment_path(dir: &Path, base_name: &str, index: u64) -> PathBuf {
    if index == 0 {
        dir.join(base_name)
    } else {
        dir.join(format!("{base_name}.{index}"))
    }
}

/// Find existing segment files for `base_name` in `dir`, sorted by index.
pub fn discover(dir: &Path, base_name: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == base_name {
            found.push((0, entry.path()));
        } else if let Some(suffix) = name.strip_prefix(&format!("{base_name}.")) {
            if let Ok(index) = suffix.parse::<u64>() {
                found.push((index, entry.path()));
            }
        }
    }
    found.sort_by_key(|(index, _)| *index);
    Ok(found)
}

impl Segment {
    pub fn create(dir: &Path, base_name: &str, index: u64) -> Result<Self> {
        let path = segment_path(dir, base_name, index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            index,
            file: Mutex::new(file),
            len: AtomicU64::new(len),
        })
    }

    /// Open a known set of segment files and scan them to find the
    /// highest durable LSN, used to resume `next_lsn` on restart.
    pub fn open_all(existing: Vec<(u64, PathBuf)>) -> Result<(std::collections::VecDeque<Self>, u64)> {
        let mut segments = std::collections::VecDeque::new();
        let mut max_lsn = 0u64;
        for (index, path) in existing {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let len = file.metadata()?.len();
            let seg = Self {
                path,
                index,
                file: Mutex::new(file),
                len: AtomicU64::new(len),
            };
            for raw in seg.read_all()? {
                if let Ok((lsn, _, _)) = LogRecord::decode(&raw) {
                    max_lsn = max_lsn.max(lsn);
                } else {
                    break;
                }
            }
            segments.push_back(seg);
        }
        Ok((segments, max_lsn))
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        self.len.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }

    /// Read and checksum-validate every record in this segment, in order.
    /// Stops at the first invalid record (partial write / torn tail).
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        drop(file);

        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let payload_start = pos + 4;
            let payload_end = payload_start + len;
            let checksum_end = payload_end + 4;
            if checksum_end > buf.len() {
                break;
            }
            let payload = &buf[payload_start..payload_end];
            let expected = u32::from_le_bytes(buf[payload_end..checksum_end].try_into().unwrap());
            if crc32fast::hash(payload) != expected {
                break;
            }
            out.push(payload.to_vec());
            pos = checksum_end;
        }
        Ok(out)
    }

    /// Best-effort hint of the highest LSN this segment could contain,
    /// used by `truncate` to decide whether a segment is safe to delete.
    pub fn max_lsn_hint(&self) -> u64 {
        self.read_all()
            .ok()
            .and_then(|records| records.last().cloned())
            .and_then(|raw| LogRecord::decode(&raw).ok())
            .map(|(lsn, _, _): (u64, Option<TransactionId>, LogRecord)| lsn)
            .unwrap_or(0)
    }

    pub fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
