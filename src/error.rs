//! Typed error taxonomy for the storage kernel (spec §7).
//!
//! Every fallible operation in this crate returns `Result<T>`. Low-level I/O
//! errors propagate upward without killing the owning transaction; lock
//! timeouts and deadlocks carry enough information for the caller to map them
//! to MySQL error codes/SQLSTATEs at the protocol layer (out of scope here).

use thiserror::Error;

use crate::txn::TransactionId;

#[derive(Error, Debug)]
pub enum EngineError {
    // --- Storage ---
    #[error("page corrupted: {0}")]
    PageCorrupted(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("disk full")]
    DiskFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page has no space for {requested} bytes ({available} available)")]
    NoSpace { requested: usize, available: usize },

    #[error("slot not found: {0:?}")]
    SlotNotFound(crate::page::RowId),

    #[error("buffer pool exhausted: all {0} frames pinned")]
    BufferPoolExhausted(usize),

    // --- Concurrency ---
    #[error("lock wait timed out after {0}ms")]
    LockTimeout(u64),

    #[error("deadlock detected, victim txn {0}")]
    Deadlock(TransactionId),

    #[error("transaction not started: {0}")]
    TransactionNotStarted(TransactionId),

    #[error("transaction {0} already in terminal state")]
    TransactionAlreadyTerminal(TransactionId),

    #[error("operation canceled")]
    Canceled,

    // --- Constraints ---
    #[error("duplicate key")]
    DuplicateKey,

    #[error("null constraint violated on column {0}")]
    NullConstraint(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    // --- Catalog (surfaced, owned by the external catalog collaborator) ---
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    // --- Protocol (surfaced, owned by the external protocol collaborator) ---
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("connection closed")]
    ConnectionClosed,

    // --- Engine-internal ---
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("engine is in a degraded state and rejects new writes")]
    Degraded,

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<bincode::error::EncodeError> for EngineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// MySQL-compatible (error code, SQLSTATE) pair, for the protocol layer to
/// surface without needing to know this crate's internal error shape.
impl EngineError {
    pub fn mysql_code(&self) -> (u16, &'static str) {
        match self {
            EngineError::Deadlock(_) => (1213, "40001"),
            EngineError::LockTimeout(_) => (1205, "HY000"),
            EngineError::DuplicateKey => (1062, "23000"),
            EngineError::TableNotFound(_) => (1146, "42S02"),
            EngineError::TableAlreadyExists(_) => (1050, "42S01"),
            EngineError::NullConstraint(_) => (1048, "23000"),
            EngineError::AuthenticationFailed => (1045, "28000"),
            _ => (1105, "HY000"),
        }
    }
}
