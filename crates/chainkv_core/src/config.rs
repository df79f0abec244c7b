//! Store configuration.

use crate::codec::MAX_TX_PAYLOAD_LEN;

/// Configuration for an [`ImmuStore`](crate::ImmuStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,
    /// Maximum value length in bytes.
    pub max_value_len: usize,
    /// Maximum number of entries in one transaction.
    pub max_tx_entries: usize,
    /// Maximum encoded size of one transaction in bytes.
    ///
    /// Never effective above [`MAX_TX_PAYLOAD_LEN`].
    pub max_tx_bytes: usize,
    /// Flush the log to stable storage before a commit returns.
    pub sync_on_commit: bool,
    /// Create the store directory if it does not exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_key_len: 1024,
            max_value_len: 4 * 1024 * 1024,
            max_tx_entries: 1024,
            max_tx_bytes: 32 * 1024 * 1024,
            sync_on_commit: true,
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    /// Sets the maximum key length.
    #[must_use]
    pub fn max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Sets the maximum value length.
    #[must_use]
    pub fn max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len;
        self
    }

    /// Sets the maximum number of entries per transaction.
    #[must_use]
    pub fn max_tx_entries(mut self, entries: usize) -> Self {
        self.max_tx_entries = entries;
        self
    }

    /// Sets the maximum encoded transaction size.
    #[must_use]
    pub fn max_tx_bytes(mut self, bytes: usize) -> Self {
        self.max_tx_bytes = bytes;
        self
    }

    /// The transaction size limit actually enforced.
    #[must_use]
    pub fn effective_max_tx_bytes(&self) -> usize {
        self.max_tx_bytes.min(MAX_TX_PAYLOAD_LEN)
    }

    /// Enables or disables flushing on every commit.
    #[must_use]
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Sets whether a missing directory is created on open.
    #[must_use]
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = StoreConfig::default().max_key_len(16).sync_on_commit(false);
        assert_eq!(config.max_key_len, 16);
        assert!(!config.sync_on_commit);
        assert_eq!(config.max_tx_entries, 1024);
    }

    #[test]
    fn tx_byte_limit_is_capped_by_the_log() {
        assert_eq!(StoreConfig::default().effective_max_tx_bytes(), 32 * 1024 * 1024);
        let config = StoreConfig::default().max_tx_bytes(usize::MAX);
        assert_eq!(config.effective_max_tx_bytes(), MAX_TX_PAYLOAD_LEN);
        assert_eq!(StoreConfig::default().max_tx_bytes(100).effective_max_tx_bytes(), 100);
    }
}
