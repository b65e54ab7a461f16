//! Lock modes and their compatibility matrix (spec §3 "Lock entry").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Intent Shared: intent to acquire S at a finer granularity.
    IS,
    /// Intent Exclusive: intent to acquire X at a finer granularity.
    IX,
    /// Shared: read lock.
    S,
    /// Shared with Intent Exclusive.
    SIX,
    /// Exclusive: write lock.
    X,
}

impl LockMode {
    /// Whether `self` may be held concurrently with `other` by two
    /// different transactions on the same key.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IS, IS) | (IS, IX) | (IS, S) | (IS, SIX)
                | (IX, IS) | (IX, IX)
                | (S, IS) | (S, S)
                | (SIX, IS)
        )
    }

    fn strength(self) -> u8 {
        match self {
            LockMode::IS => 1,
            LockMode::IX => 2,
            LockMode::S => 3,
            LockMode::SIX => 4,
            LockMode::X => 5,
        }
    }

    /// S -> X upgrade is the only one this engine performs, and only when
    /// the requester is the lock's sole holder (spec §4.7).
    pub fn is_upgrade(self, from: LockMode) -> bool {
        from == LockMode::S && self == LockMode::X || self.strength() > from.strength()
    }
}
