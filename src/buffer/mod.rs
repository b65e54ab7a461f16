//! Buffer Pool (C3): page cache with LRU-K young/old regions, pinning,
//! dirty tracking, and flush — enforcing the WAL rule (a dirty page may
//! only reach disk once the WAL has been durably flushed through its
//! `page_lsn`).

mod pool;

pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PinGuard};
