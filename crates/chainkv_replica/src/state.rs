//! Replica lifecycle state and counters.

use chainkv_core::TxId;

/// Where the replica is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Not connected; waiting to (re)connect.
    Disconnected,
    /// Connecting and handshaking.
    Connecting,
    /// Applying transactions from an open session.
    Streaming,
    /// Stopped on request.
    Stopped,
    /// Stopped by an error that retrying cannot fix.
    Failed,
}

impl ReplicaState {
    /// Whether the replica holds or is opening a session.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }

    /// Whether the run loop has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Counters kept by a replicator.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorStats {
    /// Connection attempts, successful or not.
    pub connection_attempts: u64,
    /// Sessions that completed the handshake.
    pub sessions: u64,
    /// Backoff waits taken.
    pub retries: u64,
    /// Transactions appended to the local store.
    pub txs_applied: u64,
    /// Transactions received again and skipped.
    pub txs_skipped: u64,
    /// Divergent transactions dropped.
    pub txs_discarded: u64,
    /// Last transaction applied or confirmed.
    pub last_applied_tx_id: TxId,
    /// Most recent error.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_classification() {
        assert!(ReplicaState::Streaming.is_active());
        assert!(ReplicaState::Connecting.is_active());
        assert!(!ReplicaState::Disconnected.is_active());
        assert!(ReplicaState::Failed.is_terminal());
        assert!(ReplicaState::Stopped.is_terminal());
        assert!(!ReplicaState::Streaming.is_terminal());
    }
}
