//! Transaction state machine and isolation levels (spec §3 "Transaction").

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::read_view::ReadView;
use super::TransactionId;
use crate::undo::UndoPtr;

/// Level requested by the caller. READ UNCOMMITTED and SERIALIZABLE are
/// accepted but degrade internally (spec §1 Non-goals); `requested_isolation`
/// vs `effective_isolation` on [`Transaction`] make that degradation
/// observable rather than silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn effective(self) -> IsolationLevel {
        match self {
            IsolationLevel::ReadUncommitted => IsolationLevel::ReadCommitted,
            IsolationLevel::Serializable => IsolationLevel::RepeatableRead,
            other => other,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub requested_isolation: IsolationLevel,
    pub effective_isolation: IsolationLevel,
    pub start_time: u64,
    pub read_view: Option<ReadView>,
    pub last_undo_ptr: Option<UndoPtr>,
    pub read_only: bool,
}

impl Transaction {
    pub fn new(
        id: TransactionId,
        requested_isolation: IsolationLevel,
        effective_isolation: IsolationLevel,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            requested_isolation,
            effective_isolation,
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            read_view: None,
            last_undo_ptr: None,
            read_only: false,
        }
    }
}
