//! Error types for the chainkv store.

use crate::precondition::PreconditionKind;
use crate::types::TxId;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Structural faults of a precondition, detected before evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionFault {
    /// A missing precondition was registered or evaluated.
    Null,
    /// The precondition targets an empty key.
    EmptyKey,
    /// The precondition key exceeds the store's key length limit.
    KeyTooLong {
        /// Actual key length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl fmt::Display for PreconditionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null precondition"),
            Self::EmptyKey => f.write_str("precondition key is empty"),
            Self::KeyTooLong { len, max } => {
                write!(f, "precondition key length {len} exceeds maximum {max}")
            }
        }
    }
}

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend error outside the commit path.
    #[error("storage error: {0}")]
    Storage(#[from] chainkv_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A required argument was missing or malformed.
    #[error("illegal arguments: {message}")]
    IllegalArguments {
        /// What was wrong.
        message: String,
    },

    /// The transaction or the store has already been closed.
    #[error("already closed")]
    AlreadyClosed,

    /// A precondition is structurally invalid.
    #[error("invalid precondition: {0}")]
    InvalidPrecondition(PreconditionFault),

    /// A precondition did not hold at commit time.
    #[error("precondition {kind} failed for key {key:?}")]
    PreconditionFailed {
        /// Which kind of precondition was violated.
        kind: PreconditionKind,
        /// The key it was registered for.
        key: Vec<u8>,
    },

    /// Transaction options are invalid.
    #[error("invalid transaction options: {message}")]
    InvalidOptions {
        /// What was wrong.
        message: String,
    },

    /// Write or commit attempted on a read-only transaction.
    #[error("read-only transaction")]
    ReadOnlyTx,

    /// Read attempted on a write-only transaction.
    #[error("write-only transaction")]
    WriteOnlyTx,

    /// Key longer than the configured maximum.
    #[error("key length {len} exceeds maximum {max}")]
    MaxKeyLenExceeded {
        /// Actual key length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Value longer than the configured maximum.
    #[error("value length {len} exceeds maximum {max}")]
    MaxValueLenExceeded {
        /// Actual value length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Too many entries staged in one transaction.
    #[error("transaction exceeds {max} entries")]
    MaxTxEntriesExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// Staged entries would encode to more bytes than one transaction may hold.
    #[error("transaction size {len} bytes exceeds maximum {max}")]
    MaxTxBytesExceeded {
        /// Encoded size including the rejected entry.
        len: usize,
        /// Effective maximum.
        max: usize,
    },

    /// Commit of a transaction with no staged entries.
    #[error("no entries provided")]
    NoEntriesProvided,

    /// The requested transaction has not been committed.
    #[error("transaction {0} not found")]
    TxNotFound(TxId),

    /// A durable append failed; the store no longer accepts commits.
    #[error("durability failure: {message}")]
    Durability {
        /// Description of the failure.
        message: String,
    },

    /// The tx log is damaged.
    #[error("log corruption: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch in a log record.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Record offset.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A transaction does not chain to its predecessor.
    #[error("broken hash chain at {tx_id}")]
    BrokenChain {
        /// The transaction whose `prev_alh` or `Alh` did not match.
        tx_id: TxId,
    },

    /// A replicated transaction arrived ahead of its predecessor.
    #[error("transaction out of order: expected {expected}, got {actual}")]
    TxOutOfOrder {
        /// The next id this store can append.
        expected: TxId,
        /// The id that was offered.
        actual: TxId,
    },

    /// A replicated transaction differs from the local one with the same id.
    #[error("transaction {tx_id} diverges from local history")]
    TxDiverged {
        /// The conflicting id.
        tx_id: TxId,
    },

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,
}

impl StoreError {
    /// Creates an illegal-arguments error.
    pub fn illegal_arguments(message: impl Into<String>) -> Self {
        Self::IllegalArguments {
            message: message.into(),
        }
    }

    /// Creates an invalid-options error.
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    /// Creates a durability error.
    pub fn durability(message: impl Into<String>) -> Self {
        Self::Durability {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Whether the store instance is unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Durability { .. }
                | Self::Corrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::BrokenChain { .. }
        )
    }

    /// Whether this is any structural precondition error.
    #[must_use]
    pub fn is_invalid_precondition(&self) -> bool {
        matches!(self, Self::InvalidPrecondition(_))
    }

    /// Whether a precondition was evaluated and did not hold.
    #[must_use]
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_precondition_is_also_generic() {
        let err = StoreError::InvalidPrecondition(PreconditionFault::Null);
        assert!(err.is_invalid_precondition());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "invalid precondition: null precondition");
    }

    #[test]
    fn durability_is_fatal() {
        assert!(StoreError::durability("disk full").is_fatal());
        assert!(StoreError::BrokenChain { tx_id: TxId(3) }.is_fatal());
        assert!(!StoreError::AlreadyClosed.is_fatal());
    }
}
