//! Ongoing transactions.

use crate::codec::{entry_encoded_len, TX_HEADER_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::options::TxOptions;
use crate::precondition::Precondition;
use crate::store::{ImmuStore, Snapshot};
use crate::tx::{Entry, EntryMetadata, TxHeader};
use crate::types::TxId;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of an [`OngoingTx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting writes, reads and preconditions.
    Open,
    /// Committed or cancelled; every operation fails with `AlreadyClosed`.
    Closed,
}

#[derive(Debug, Clone)]
struct StagedValue {
    value: Vec<u8>,
    deleted: bool,
}

/// A transaction being built.
///
/// Owned by one caller until [`OngoingTx::commit`] consumes it or
/// [`OngoingTx::cancel`] closes it. Staged writes are kept ordered by key;
/// writing a key twice keeps the last value. Nothing reaches the log before
/// commit.
pub struct OngoingTx<'a> {
    store: &'a ImmuStore,
    options: TxOptions,
    state: TxState,
    entries: BTreeMap<Vec<u8>, StagedValue>,
    /// Encoded size of the staged entries, header included.
    staged_bytes: usize,
    preconditions: Vec<Precondition>,
    snapshot: Snapshot<'a>,
}

impl<'a> OngoingTx<'a> {
    pub(crate) fn new(store: &'a ImmuStore, options: TxOptions, snapshot: Snapshot<'a>) -> Self {
        Self {
            store,
            options,
            state: TxState::Open,
            entries: BTreeMap::new(),
            staged_bytes: TX_HEADER_SIZE,
            preconditions: Vec::new(),
            snapshot,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Whether the transaction has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == TxState::Closed
    }

    /// Options the transaction was opened with.
    #[must_use]
    pub fn options(&self) -> &TxOptions {
        &self.options
    }

    /// The committed transaction reads are currently served from.
    #[must_use]
    pub fn snapshot_tx_id(&self) -> TxId {
        self.snapshot.tx_id()
    }

    /// Number of staged entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Encoded size the staged entries would commit as.
    #[must_use]
    pub fn staged_bytes(&self) -> usize {
        self.staged_bytes
    }

    /// Whether nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stages a write of `value` under `key`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyClosed`] if the transaction is closed
    /// - [`StoreError::ReadOnlyTx`] in read-only mode
    /// - [`StoreError::IllegalArguments`] for an empty key
    /// - size limit errors from the store configuration
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> StoreResult<()> {
        self.stage(key.into(), value.into(), false)
    }

    /// Stages a logical deletion of `key`.
    ///
    /// # Errors
    ///
    /// Same as [`OngoingTx::set`].
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> StoreResult<()> {
        self.stage(key.into(), Vec::new(), true)
    }

    fn stage(&mut self, key: Vec<u8>, value: Vec<u8>, deleted: bool) -> StoreResult<()> {
        self.ensure_open()?;
        if !self.options.mode.can_write() {
            return Err(StoreError::ReadOnlyTx);
        }

        let config = self.store.config();
        if key.is_empty() {
            return Err(StoreError::illegal_arguments("key must not be empty"));
        }
        if key.len() > config.max_key_len {
            return Err(StoreError::MaxKeyLenExceeded {
                len: key.len(),
                max: config.max_key_len,
            });
        }
        if value.len() > config.max_value_len {
            return Err(StoreError::MaxValueLenExceeded {
                len: value.len(),
                max: config.max_value_len,
            });
        }
        let replaced = self
            .entries
            .get(&key)
            .map(|old| entry_encoded_len(key.len(), old.value.len()));
        if replaced.is_none() && self.entries.len() >= config.max_tx_entries {
            return Err(StoreError::MaxTxEntriesExceeded {
                max: config.max_tx_entries,
            });
        }
        let staged_bytes = self.staged_bytes - replaced.unwrap_or(0)
            + entry_encoded_len(key.len(), value.len());
        let max_tx_bytes = config.effective_max_tx_bytes();
        if staged_bytes > max_tx_bytes {
            return Err(StoreError::MaxTxBytesExceeded {
                len: staged_bytes,
                max: max_tx_bytes,
            });
        }

        self.staged_bytes = staged_bytes;
        self.entries.insert(key, StagedValue { value, deleted });
        Ok(())
    }

    /// Reads `key`, seeing this transaction's own writes first.
    ///
    /// Deleted keys read as `None`. A snapshot older than the renewal
    /// period is re-acquired before reading.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyClosed`] if the transaction or store is closed,
    /// [`StoreError::WriteOnlyTx`] in write-only mode.
    pub fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        if !self.options.mode.can_read() {
            return Err(StoreError::WriteOnlyTx);
        }
        if let Some(staged) = self.entries.get(key) {
            return Ok((!staged.deleted).then(|| staged.value.clone()));
        }

        if self.snapshot.age() > self.options.snapshot_renewal_period {
            self.snapshot = self.store.snapshot();
        }
        Ok(self
            .snapshot
            .get(key)?
            .filter(|v| !v.deleted)
            .map(|v| v.value.to_vec()))
    }

    /// Registers a precondition evaluated at commit time.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - [`StoreError::IllegalArguments`] if `precondition` is `None`
    /// - [`StoreError::AlreadyClosed`] if the transaction is closed
    /// - [`StoreError::InvalidPrecondition`] if it is structurally invalid
    pub fn add_precondition(&mut self, precondition: Option<Precondition>) -> StoreResult<()> {
        let precondition = precondition
            .ok_or_else(|| StoreError::illegal_arguments("precondition must be provided"))?;
        self.ensure_open()?;
        precondition.validate(self.store.config().max_key_len)?;
        self.preconditions.push(precondition);
        Ok(())
    }

    /// Commits the staged entries.
    ///
    /// The transaction is closed whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyClosed`] if already cancelled
    /// - [`StoreError::ReadOnlyTx`] in read-only mode
    /// - [`StoreError::NoEntriesProvided`] if nothing was staged
    /// - [`StoreError::PreconditionFailed`] for the first violated precondition
    /// - [`StoreError::Durability`] if the store could not persist the record
    pub fn commit(mut self) -> StoreResult<TxHeader> {
        self.ensure_open()?;
        self.state = TxState::Closed;

        if !self.options.mode.can_write() {
            return Err(StoreError::ReadOnlyTx);
        }
        if self.entries.is_empty() {
            return Err(StoreError::NoEntriesProvided);
        }

        let entries = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(key, staged)| {
                Entry::with_metadata(key, staged.value, EntryMetadata { deleted: staged.deleted })
            })
            .collect();

        self.store.commit_staged(
            &mut self.snapshot,
            self.options.snapshot_renewal_period,
            &self.preconditions,
            entries,
        )
    }

    /// Abandons the transaction. The log is not touched.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyClosed`] if already closed.
    pub fn cancel(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.state = TxState::Closed;
        self.entries.clear();
        self.staged_bytes = TX_HEADER_SIZE;
        self.preconditions.clear();
        Ok(())
    }

    fn ensure_open(&self) -> StoreResult<()> {
        match self.state {
            TxState::Open => Ok(()),
            TxState::Closed => Err(StoreError::AlreadyClosed),
        }
    }
}

impl fmt::Debug for OngoingTx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OngoingTx")
            .field("state", &self.state)
            .field("mode", &self.options.mode)
            .field("entries", &self.entries.len())
            .field("staged_bytes", &self.staged_bytes)
            .field("preconditions", &self.preconditions.len())
            .field("snapshot_tx_id", &self.snapshot.tx_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::PreconditionFault;
    use std::time::Duration;

    fn store() -> ImmuStore {
        ImmuStore::open_in_memory(StoreConfig::default().max_key_len(8).max_tx_entries(2)).unwrap()
    }

    #[test]
    fn add_precondition_none_is_illegal_even_when_closed() {
        let store = store();
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        assert!(matches!(tx.add_precondition(None), Err(StoreError::IllegalArguments { .. })));

        tx.cancel().unwrap();
        assert!(matches!(tx.add_precondition(None), Err(StoreError::IllegalArguments { .. })));
    }

    #[test]
    fn add_precondition_on_closed_tx_fails_for_valid_input() {
        let store = store();
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        tx.cancel().unwrap();

        let valid = Precondition::key_must_exist(b"k".to_vec());
        assert!(matches!(tx.add_precondition(Some(valid)), Err(StoreError::AlreadyClosed)));
        let invalid = Precondition::key_must_exist(Vec::new());
        assert!(matches!(tx.add_precondition(Some(invalid)), Err(StoreError::AlreadyClosed)));
    }

    #[test]
    fn add_precondition_validates_structure() {
        let store = store();
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        let err = tx
            .add_precondition(Some(Precondition::key_must_not_exist(vec![0; 9])))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidPrecondition(PreconditionFault::KeyTooLong { len: 9, max: 8 })
        ));
    }

    #[test]
    fn reads_see_own_writes_and_deletes() {
        let store = store();
        let mut seed = store.new_tx(TxOptions::read_write()).unwrap();
        seed.set(b"a", b"1").unwrap();
        seed.commit().unwrap();

        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        tx.set(b"a", b"2").unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"2".to_vec()));
        tx.delete(b"a").unwrap();
        assert_eq!(tx.get(b"a").unwrap(), None);
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn staging_limits() {
        let store = store();
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        assert!(matches!(tx.set(Vec::new(), b"v"), Err(StoreError::IllegalArguments { .. })));
        assert!(matches!(tx.set(vec![1; 9], b"v"), Err(StoreError::MaxKeyLenExceeded { .. })));
        tx.set(b"a", b"1").unwrap();
        tx.set(b"b", b"1").unwrap();
        tx.set(b"a", b"overwrite").unwrap();
        assert!(matches!(tx.set(b"c", b"1"), Err(StoreError::MaxTxEntriesExceeded { max: 2 })));
    }

    #[test]
    fn staged_size_is_bounded() {
        let entry = entry_encoded_len(1, 100);
        let config = StoreConfig::default().max_tx_bytes(TX_HEADER_SIZE + 2 * entry);
        let store = ImmuStore::open_in_memory(config).unwrap();
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();

        tx.set(b"a", vec![0; 100]).unwrap();
        tx.set(b"b", vec![0; 100]).unwrap();
        assert_eq!(tx.staged_bytes(), TX_HEADER_SIZE + 2 * entry);
        let err = tx.set(b"c", Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::MaxTxBytesExceeded { max, .. } if max == TX_HEADER_SIZE + 2 * entry));
        assert_eq!(tx.len(), 2);

        // Overwrites are charged the difference only.
        assert!(matches!(tx.set(b"a", vec![0; 101]), Err(StoreError::MaxTxBytesExceeded { .. })));
        tx.set(b"a", vec![0; 40]).unwrap();
        tx.delete(b"b").unwrap();
        tx.set(b"c", vec![0; 100]).unwrap();
        assert_eq!(
            tx.staged_bytes(),
            TX_HEADER_SIZE + entry_encoded_len(1, 40) + entry_encoded_len(1, 0) + entry
        );

        let header = tx.commit().unwrap();
        let committed = store.read_tx(header.id).unwrap();
        assert_eq!(
            crate::codec::encoded_tx_len(&committed),
            TX_HEADER_SIZE + entry_encoded_len(1, 40) + entry_encoded_len(1, 0) + entry
        );
    }

    #[test]
    fn modes_restrict_operations() {
        let store = store();
        let mut ro = store.new_tx(TxOptions::read_only()).unwrap();
        assert!(matches!(ro.set(b"k", b"v"), Err(StoreError::ReadOnlyTx)));
        assert_eq!(ro.get(b"k").unwrap(), None);
        assert!(matches!(ro.commit(), Err(StoreError::ReadOnlyTx)));

        let mut wo = store.new_tx(TxOptions::write_only()).unwrap();
        assert!(matches!(wo.get(b"k"), Err(StoreError::WriteOnlyTx)));
    }

    #[test]
    fn invalid_options_are_rejected_on_open() {
        let store = store();
        assert!(matches!(
            store.new_tx(TxOptions::default()),
            Err(StoreError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn empty_commit_is_rejected() {
        let store = store();
        let tx = store.new_tx(TxOptions::write_only()).unwrap();
        assert!(matches!(tx.commit(), Err(StoreError::NoEntriesProvided)));
        assert_eq!(store.last_committed_tx_id(), TxId::NONE);
    }

    #[test]
    fn cancelled_tx_cannot_commit() {
        let store = store();
        let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
        tx.set(b"k", b"v").unwrap();
        tx.cancel().unwrap();
        assert!(tx.is_closed());
        assert!(matches!(tx.cancel(), Err(StoreError::AlreadyClosed)));
        assert!(matches!(tx.commit(), Err(StoreError::AlreadyClosed)));
        assert_eq!(store.last_committed_tx_id(), TxId::NONE);
    }

    #[test]
    fn aged_snapshot_is_renewed_on_read() {
        let store = store();
        let options = TxOptions::read_only().snapshot_renewal_period(Duration::from_millis(1));
        let mut reader = store.new_tx(options).unwrap();
        assert_eq!(reader.snapshot_tx_id(), TxId::NONE);

        let mut writer = store.new_tx(TxOptions::write_only()).unwrap();
        writer.set(b"k", b"v").unwrap();
        writer.commit().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reader.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(reader.snapshot_tx_id(), TxId(1));
    }
}
