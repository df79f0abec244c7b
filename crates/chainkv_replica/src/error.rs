//! Replication error types.

use chainkv_core::StoreError;
use chainkv_repl_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type for replica operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors raised while following a primary.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The options cannot drive a replica.
    #[error("invalid replication options: {0}")]
    InvalidOptions(String),

    /// The primary could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Wire-level failure on an established connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The primary refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The primary answered a request with an error.
    #[error("primary error ({code:?}): {message}")]
    Remote {
        /// Error category.
        code: ErrorCode,
        /// Detail from the primary.
        message: String,
    },

    /// The local store refused a transaction.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A worker task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

impl ReplicationError {
    /// Creates an invalid options error.
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions(message.into())
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Whether reconnecting after a backoff may clear the error.
    ///
    /// Transport and session failures are retryable. A local store that
    /// received a transaction out of order is too, since a new session
    /// resumes from the last applied id. Integrity failures are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Protocol(_) | Self::Remote { .. } => true,
            Self::Store(err) => matches!(err, StoreError::TxOutOfOrder { .. }),
            Self::InvalidOptions(_) | Self::Rejected(_) | Self::Task(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainkv_core::TxId;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ReplicationError::connection("refused").is_retryable());
        assert!(ReplicationError::from(ProtocolError::ConnectionClosed).is_retryable());
        assert!(ReplicationError::Remote {
            code: ErrorCode::InvalidSession,
            message: "expired".into(),
        }
        .is_retryable());
        assert!(ReplicationError::from(StoreError::TxOutOfOrder {
            expected: TxId(3),
            actual: TxId(5),
        })
        .is_retryable());
    }

    #[test]
    fn integrity_errors_are_fatal() {
        assert!(!ReplicationError::from(StoreError::BrokenChain { tx_id: TxId(2) }).is_retryable());
        assert!(!ReplicationError::from(StoreError::TxDiverged { tx_id: TxId(2) }).is_retryable());
        assert!(!ReplicationError::from(StoreError::corrupted("bad hash")).is_retryable());
        assert!(!ReplicationError::Rejected("bad credentials".into()).is_retryable());
    }
}
