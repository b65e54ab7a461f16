//! Undo record shape (spec §3 "Undo record").

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::page::RowId;
use crate::txn::TransactionId;
use crate::wal::Lsn;

use super::UndoPtr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoKind {
    Insert,
    Update,
    Delete,
}

/// `payload` is the primary key for an Insert undo (so rollback can delete
/// it) and the pre-image row bytes for Update/Delete undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub kind: UndoKind,
    pub txn_id: TransactionId,
    pub table_id: u32,
    pub row_id: RowId,
    pub prev_undo_ptr: Option<UndoPtr>,
    pub payload: Vec<u8>,
    pub redo_lsn: Lsn,
}

impl UndoRecord {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("in-memory encode cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (record, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok(record)
    }
}
