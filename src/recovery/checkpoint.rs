//! Checkpoint file I/O (spec §6 persisted file layout, §4.9).
//!
//! `checkpoint.meta` layout, little-endian:
//! `[checkpoint_lsn:i64 | start_ticks:i64 | end_ticks:i64 | next_txn_id:i64 |
//! n:i32 | active_txn_ids:i64·n]`, published atomically via temp-file +
//! rename. `next_txn_id` lets recovery restore the transaction id counter
//! without ever reissuing an id a pre-restart transaction already used —
//! reusing one would let a stale `ReadView` accidentally treat an old
//! committed row as "created by me".

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::txn::TransactionId;
use crate::wal::Lsn;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub checkpoint_lsn: Lsn,
    pub start_ticks: i64,
    pub end_ticks: i64,
    pub next_txn_id: TransactionId,
    pub active_txn_ids: Vec<TransactionId>,
}

impl CheckpointMeta {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36 + self.active_txn_ids.len() * 8);
        buf.extend_from_slice(&(self.checkpoint_lsn as i64).to_le_bytes());
        buf.extend_from_slice(&self.start_ticks.to_le_bytes());
        buf.extend_from_slice(&self.end_ticks.to_le_bytes());
        buf.extend_from_slice(&(self.next_txn_id as i64).to_le_bytes());
        buf.extend_from_slice(&(self.active_txn_ids.len() as i32).to_le_bytes());
        for id in &self.active_txn_ids {
            buf.extend_from_slice(&(*id as i64).to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(EngineError::Recovery("checkpoint.meta truncated".into()));
        }
        let checkpoint_lsn = i64::from_le_bytes(buf[0..8].try_into().unwrap()) as Lsn;
        let start_ticks = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let end_ticks = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let next_txn_id = i64::from_le_bytes(buf[24..32].try_into().unwrap()) as TransactionId;
        let n = i32::from_le_bytes(buf[32..36].try_into().unwrap()) as usize;
        let expected_len = 36 + n * 8;
        if buf.len() < expected_len {
            return Err(EngineError::Recovery(
                "checkpoint.meta active-txn list truncated".into(),
            ));
        }
        let mut active_txn_ids = Vec::with_capacity(n);
        for i in 0..n {
            let start = 36 + i * 8;
            active_txn_ids.push(i64::from_le_bytes(buf[start..start + 8].try_into().unwrap()) as TransactionId);
        }
        Ok(Self {
            checkpoint_lsn,
            start_ticks,
            end_ticks,
            next_txn_id,
            active_txn_ids,
        })
    }
}

/// Write `meta` to `path` atomically: write to a sibling temp file, fsync,
/// then rename over the destination.
pub fn write_atomic(path: &Path, meta: &CheckpointMeta) -> Result<()> {
    let tmp_path: PathBuf = path.with_extension("meta.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&meta.encode())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Option<CheckpointMeta>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(Some(CheckpointMeta::decode(&buf)?))
}
