//! WAL record shape (spec §3 "WAL entry").

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::page::PageId;
use crate::txn::TransactionId;

use super::Lsn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogRecord {
    Begin,
    Commit,
    Abort,
    Insert {
        page_id: PageId,
        slot: u16,
        new_bytes: Vec<u8>,
    },
    Update {
        page_id: PageId,
        slot: u16,
        old_bytes: Vec<u8>,
        new_bytes: Vec<u8>,
    },
    Delete {
        page_id: PageId,
        slot: u16,
        old_bytes: Vec<u8>,
    },
    Checkpoint {
        active_txns: Vec<TransactionId>,
    },
}

/// On-the-wire envelope: LSN and transaction id precede the record body so
/// recovery can validate ordering without re-deriving it from file offset.
#[derive(Serialize, Deserialize)]
struct Envelope {
    lsn: Lsn,
    txn_id: Option<TransactionId>,
    record: LogRecord,
}

impl LogRecord {
    pub(super) fn encode(&self, lsn: Lsn, txn_id: Option<TransactionId>) -> Vec<u8> {
        let envelope = Envelope {
            lsn,
            txn_id,
            record: self.clone(),
        };
        bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
            .expect("in-memory encode cannot fail")
    }

    pub(super) fn decode(bytes: &[u8]) -> Result<(Lsn, Option<TransactionId>, LogRecord)> {
        let (envelope, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok((envelope.lsn, envelope.txn_id, envelope.record))
    }
}
