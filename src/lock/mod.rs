//! Lock Manager (C7): lock modes, compatibility matrix, table/row/gap/
//! page/database granularities, deadlock detection.

mod deadlock;
mod gap;
mod key;
mod manager;
mod mode;

pub use key::LockKey;
pub use manager::{LockManager, LockManagerConfig};
pub use mode::LockMode;
