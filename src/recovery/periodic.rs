//! Periodic checkpoint orchestration (spec §4.9 steps 1-5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::txn::TransactionManager;
use crate::undo::UndoLog;
use crate::wal::WalManager;

use super::checkpoint::{self, CheckpointMeta};

pub struct CheckpointManager {
    wal: Arc<WalManager>,
    pool: Arc<BufferPool>,
    txn_manager: Arc<TransactionManager>,
    undo: Arc<UndoLog>,
    meta_path: PathBuf,
}

fn now_ticks() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl CheckpointManager {
    pub fn new(
        wal: Arc<WalManager>,
        pool: Arc<BufferPool>,
        txn_manager: Arc<TransactionManager>,
        undo: Arc<UndoLog>,
        meta_path: PathBuf,
    ) -> Self {
        Self {
            wal,
            pool,
            txn_manager,
            undo,
            meta_path,
        }
    }

    /// Run one checkpoint: snapshot active txns, force a Checkpoint WAL
    /// record, flush every dirty page, publish `checkpoint.meta` atomically,
    /// then truncate the WAL up to `min(checkpoint_lsn, oldest undo-needed
    /// lsn)` (spec §4.9 step 5) so segments the next recovery could never
    /// need are reclaimed. Returns the checkpoint LSN recorded.
    pub fn run(&self) -> Result<CheckpointMeta> {
        let start_ticks = now_ticks();
        let active_txns: Vec<_> = self.txn_manager.active_ids().into_iter().collect();

        let checkpoint_lsn = self.wal.append(
            None,
            crate::wal::LogRecord::Checkpoint {
                active_txns: active_txns.clone(),
            },
        )?;
        self.wal.flush_up_to(checkpoint_lsn)?;

        self.pool.flush_all()?;

        let meta = CheckpointMeta {
            checkpoint_lsn,
            start_ticks,
            end_ticks: now_ticks(),
            next_txn_id: self.txn_manager.peek_next_txn_id(),
            active_txn_ids: active_txns.clone(),
        };
        checkpoint::write_atomic(&self.meta_path, &meta)?;

        let active_set: std::collections::BTreeSet<_> = active_txns.into_iter().collect();
        let oldest_undo_lsn = self.undo.oldest_redo_lsn_for(&active_set)?;
        let truncate_to = oldest_undo_lsn.map_or(checkpoint_lsn, |l| l.min(checkpoint_lsn));
        self.wal.truncate(truncate_to)?;

        tracing::info!(checkpoint_lsn, truncate_to, "checkpoint completed");
        Ok(meta)
    }

    /// Drive `run` on a fixed cadence until `shutdown` resolves. Intended
    /// to be spawned as a `tokio` task by `Engine::open`.
    pub async fn run_periodic(self: Arc<Self>, period: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run() {
                        tracing::warn!(error = %e, "periodic checkpoint failed");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::lock::{LockManager, LockManagerConfig};
    use crate::storage::{DiskManager, FsyncPolicy};
    use crate::txn::IsolationLevel;
    use crate::wal::WalConfig;

    fn setup(
        dir: &std::path::Path,
    ) -> (Arc<WalManager>, Arc<BufferPool>, Arc<TransactionManager>, Arc<UndoLog>) {
        let disk = Arc::new(DiskManager::open(dir.join("t.cdb"), FsyncPolicy::Fsync).unwrap());
        let wal = Arc::new(WalManager::open(dir.join("t.wal"), WalConfig::default()).unwrap());
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 8,
                young_ratio: 0.625,
                old_block_time_ms: 0,
            },
            disk,
            Arc::clone(&wal),
        ));
        let locks = Arc::new(LockManager::new(LockManagerConfig::default()));
        let txn_manager = Arc::new(TransactionManager::new(
            Arc::clone(&wal),
            locks,
            IsolationLevel::RepeatableRead,
        ));
        let undo = Arc::new(UndoLog::open(dir.join("t.undo")).unwrap());
        (wal, pool, txn_manager, undo)
    }

    #[test]
    fn run_publishes_checkpoint_meta() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, pool, txn_manager, undo) = setup(dir.path());
        txn_manager.begin(None).unwrap();

        let meta_path = dir.path().join("checkpoint.meta");
        let cm = CheckpointManager::new(wal, pool, txn_manager, undo, meta_path.clone());
        let meta = cm.run().unwrap();
        assert_eq!(meta.active_txn_ids.len(), 1);

        let read_back = checkpoint::read(&meta_path).unwrap().unwrap();
        assert_eq!(read_back, meta);
    }

    #[test]
    fn run_truncates_wal_once_records_are_covered() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("t.cdb"), FsyncPolicy::Fsync).unwrap());
        let wal = Arc::new(
            WalManager::open(
                dir.path().join("t.wal"),
                WalConfig {
                    segment_bytes: 64,
                    sync_after_write: false,
                },
            )
            .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 8,
                young_ratio: 0.625,
                old_block_time_ms: 0,
            },
            disk,
            Arc::clone(&wal),
        ));
        let locks = Arc::new(LockManager::new(LockManagerConfig::default()));
        let txn_manager = Arc::new(TransactionManager::new(
            Arc::clone(&wal),
            locks,
            IsolationLevel::RepeatableRead,
        ));
        let undo = Arc::new(UndoLog::open(dir.path().join("t.undo")).unwrap());

        for _ in 0..20 {
            wal.append(
                None,
                crate::wal::LogRecord::Insert {
                    page_id: 0,
                    slot: 0,
                    new_bytes: vec![0; 16],
                },
            )
            .unwrap();
        }
        let segments_before = wal.segment_count();
        assert!(segments_before > 1, "expected rotation to have occurred");

        let meta_path = dir.path().join("checkpoint.meta");
        let cm = CheckpointManager::new(Arc::clone(&wal), pool, txn_manager, undo, meta_path);
        cm.run().unwrap();

        let segments_after = wal.segment_count();
        assert!(
            segments_after < segments_before,
            "checkpoint must truncate covered WAL segments"
        );
    }
}
