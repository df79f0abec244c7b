//! Error types for the primary.

use chainkv_core::{StoreError, TxId};
use chainkv_repl_protocol::ProtocolError;
use thiserror::Error;

/// Result type for primary operations.
pub type PrimaryResult<T> = Result<T, PrimaryError>;

/// Errors on the primary side of replication.
#[derive(Debug, Error)]
pub enum PrimaryError {
    /// Store error while reading transactions.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Wire error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stream was asked for an offset it has already passed.
    #[error("invalid previous offset: requested {requested}, stream is at {position}")]
    InvalidPreviousOffset {
        /// Offset that was requested.
        requested: TxId,
        /// Next offset the stream will produce.
        position: TxId,
    },

    /// A committed transaction cannot fit in a replication frame.
    #[error("{tx_id} encodes to {len} bytes, too large to replicate")]
    TxTooLarge {
        /// The offending transaction.
        tx_id: TxId,
        /// Its encoded size.
        len: usize,
    },

    /// Credentials or token were rejected.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The token does not belong to a live session.
    #[error("unknown session")]
    UnknownSession,

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PrimaryError {
    /// Whether the replica caused the error.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPreviousOffset { .. } | Self::NotAuthorized(_) | Self::UnknownSession
        )
    }
}
