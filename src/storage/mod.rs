//! Disk Manager (C2): per-file page I/O, file growth, fsync policy.

mod disk;

pub use disk::{DiskManager, DiskStats, FsyncPolicy};
