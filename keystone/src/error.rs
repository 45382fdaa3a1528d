use thiserror::Error;

use crate::PageId;

/// Every error the engine can surface. Non-fatal user errors are returned
/// to the client without aborting; fatal errors abort the transaction at
/// the nearest transaction boundary.
#[derive(Debug, Error)]
pub enum KeystoneError {
    #[error("database file is corrupted: {0}")]
    CorruptDb(String),

    #[error("no free frame available in the buffer pool")]
    NoFrame,

    #[error("invalid page number {0}")]
    InvalidPageNumber(PageId),

    #[error("duplicate key {0}")]
    Duplicate(i64),

    #[error("cannot update non-existent key {0}")]
    MissingForUpdate(i64),

    #[error("key {0} not found")]
    NotFound(i64),

    #[error("child page {0} is unreachable")]
    ChildUnreachable(PageId),

    #[error("deadlock detected")]
    Deadlock,

    #[error("lock is not held on this resource")]
    NotHeld,

    #[error("lock mode does not match the held mode")]
    WrongMode,

    #[error("a transaction is already running for this client")]
    AlreadyBegun,

    #[error("no transaction is running for this client")]
    NoSuchTransaction,

    #[error("malformed log line: {0}")]
    BadLogLine(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("no table named {0}")]
    NoSuchTable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeystoneError {
    /// Whether this error must abort the enclosing transaction. User-level
    /// errors (duplicate key, missing key, unknown table) are reported to
    /// the client and the transaction continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            KeystoneError::Duplicate(_)
                | KeystoneError::MissingForUpdate(_)
                | KeystoneError::NotFound(_)
                | KeystoneError::TableExists(_)
                | KeystoneError::NoSuchTable(_)
                | KeystoneError::AlreadyBegun
                | KeystoneError::NoSuchTransaction
                | KeystoneError::WrongMode
                | KeystoneError::NotHeld
        )
    }
}

pub type Result<T> = std::result::Result<T, KeystoneError>;
