//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request (non-positive amount, unknown kind/source)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Account does not exist (or is tombstoned)
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Ledger entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Concurrent-write contention; retryable with the same transaction id
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// A committed entry already exists for this transaction id
    ///
    /// Surfaced by the storage layer when two submits race on the same id;
    /// the engine resolves it to the original entry instead of reporting it.
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    /// Invariant violation (negative balance, broken chain)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB); retryable
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Notification delivery error
    #[error("Notification error: {0}")]
    Notify(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may safely retry with the same transaction id
    ///
    /// Validation and not-found failures are permanent; contention and
    /// storage failures are transient and idempotency makes retry safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::Storage(_) | Error::Io(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
