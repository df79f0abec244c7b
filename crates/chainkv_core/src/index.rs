//! In-memory key index over the committed history.
//!
//! For every key the index keeps each committed version in ascending tx
//! order, so a snapshot at any `TxId` can be served without touching the log.

use crate::tx::Tx;
use crate::types::TxId;
use std::collections::HashMap;
use std::sync::Arc;

/// A committed version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRef {
    /// Transaction that wrote this version.
    pub tx_id: TxId,
    /// The value (empty for deletions).
    pub value: Arc<[u8]>,
    /// Whether this version deletes the key.
    pub deleted: bool,
}

impl ValueRef {
    /// The value bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

#[derive(Debug, Default)]
pub(crate) struct KeyIndex {
    versions: HashMap<Vec<u8>, Vec<ValueRef>>,
}

impl KeyIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records every entry of a committed transaction.
    pub(crate) fn apply(&mut self, tx: &Tx) {
        for entry in tx.entries() {
            self.versions
                .entry(entry.key().to_vec())
                .or_default()
                .push(ValueRef {
                    tx_id: tx.id(),
                    value: Arc::from(entry.value()),
                    deleted: entry.is_deleted(),
                });
        }
    }

    /// The latest version of `key` written at or before `at`.
    pub(crate) fn get_at(&self, key: &[u8], at: TxId) -> Option<ValueRef> {
        let history = self.versions.get(key)?;
        let visible = history.partition_point(|v| v.tx_id <= at);
        visible.checked_sub(1).map(|i| history[i].clone())
    }

    pub(crate) fn key_count(&self) -> usize {
        self.versions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Entry;
    use crate::types::ZERO_HASH;

    #[test]
    fn versions_are_visible_by_tx() {
        let mut index = KeyIndex::new();
        index.apply(&Tx::build(TxId(1), 0, ZERO_HASH, vec![Entry::new(b"k".to_vec(), b"v1".to_vec())]));
        index.apply(&Tx::build(TxId(3), 0, ZERO_HASH, vec![Entry::tombstone(b"k".to_vec())]));

        assert!(index.get_at(b"k", TxId::NONE).is_none());
        assert_eq!(index.get_at(b"k", TxId(2)).unwrap().value(), b"v1");
        let latest = index.get_at(b"k", TxId(3)).unwrap();
        assert!(latest.deleted);
        assert_eq!(latest.tx_id, TxId(3));
        assert_eq!(index.key_count(), 1);
    }
}
