//! The store: commit serialization, recovery and the replica append path.

use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::index::{KeyIndex, ValueRef};
use crate::log::TxLog;
use crate::ongoing::OngoingTx;
use crate::options::TxOptions;
use crate::precondition::{check_preconditions, Precondition, SnapshotReader};
use crate::tx::{Entry, Tx, TxHeader};
use crate::types::{Alh, TxId, ZERO_HASH};
use chainkv_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// The last committed transaction.
#[derive(Debug, Clone, Copy)]
struct Head {
    tx_id: TxId,
    alh: Alh,
    timestamp: u64,
}

impl Head {
    const GENESIS: Head = Head {
        tx_id: TxId::NONE,
        alh: ZERO_HASH,
        timestamp: 0,
    };

    fn of(tx: &Tx) -> Self {
        Self {
            tx_id: tx.id(),
            alh: tx.alh(),
            timestamp: tx.header().timestamp,
        }
    }

    /// Checks that `tx` can be appended right after this head.
    fn check_successor(&self, tx: &Tx) -> StoreResult<()> {
        tx.verify()?;
        if tx.id() != self.tx_id.next() {
            return Err(StoreError::corrupted(format!(
                "expected {} after {}, found {}",
                self.tx_id.next(),
                self.tx_id,
                tx.id()
            )));
        }
        if tx.header().prev_alh != self.alh {
            return Err(StoreError::BrokenChain { tx_id: tx.id() });
        }
        Ok(())
    }
}

/// Result of [`ImmuStore::replicate_tx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateOutcome {
    /// The transaction was appended.
    Applied(TxHeader),
    /// An identical transaction was already committed under this id.
    AlreadyApplied(TxHeader),
}

impl ReplicateOutcome {
    /// The header of the replicated transaction.
    #[must_use]
    pub fn header(&self) -> &TxHeader {
        match self {
            Self::Applied(h) | Self::AlreadyApplied(h) => h,
        }
    }
}

/// An immutable, hash-chained key-value store.
///
/// # Concurrency
///
/// Any number of threads may read and build transactions concurrently.
/// Commits are admitted one at a time through the commit gate, which makes
/// `TxId` assignment a strict total order. A commit becomes visible to
/// readers and to [`ImmuStore::subscribe_commits`] only after its record
/// has been durably appended.
///
/// # Durability failures
///
/// If appending a record fails, the store halts: that commit and every
/// later one return [`StoreError::Durability`]. Reopen the store to recover.
pub struct ImmuStore {
    config: StoreConfig,
    log: TxLog,
    index: RwLock<KeyIndex>,
    head: RwLock<Head>,
    commit_gate: Mutex<()>,
    closed: AtomicBool,
    halted: AtomicBool,
    commits: watch::Sender<u64>,
    _dir: Option<StoreDir>,
}

impl ImmuStore {
    /// Opens or creates a store in the directory at `path`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::StoreLocked`] if another handle owns the directory
    /// - a fatal error if the tx log is corrupted or its hash chain is broken
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path.as_ref(), config.create_if_missing)?;
        let backend = FileBackend::open(&dir.tx_log_path())?;
        tracing::debug!(path = %dir.path().display(), "opening store");
        Self::open_inner(Box::new(backend), config, Some(dir))
    }

    /// Opens an empty store that lives in memory.
    ///
    /// # Errors
    ///
    /// Never fails for a fresh backend; the signature matches the other
    /// constructors.
    pub fn open_in_memory(config: StoreConfig) -> StoreResult<Self> {
        Self::open_inner(Box::new(InMemoryBackend::new()), config, None)
    }

    /// Opens a store over an arbitrary backend, recovering its contents.
    ///
    /// # Errors
    ///
    /// Fails if the backend holds a corrupted log or a broken hash chain.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        Self::open_inner(backend, config, None)
    }

    fn open_inner(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
        dir: Option<StoreDir>,
    ) -> StoreResult<Self> {
        let mut index = KeyIndex::new();
        let mut head = Head::GENESIS;

        let log = TxLog::recover(backend, |tx| {
            head.check_successor(&tx)?;
            index.apply(&tx);
            head = Head::of(&tx);
            Ok(())
        })?;

        tracing::info!(
            last_tx_id = head.tx_id.as_u64(),
            keys = index.key_count(),
            "store opened"
        );

        let (commits, _) = watch::channel(head.tx_id.as_u64());
        Ok(Self {
            config,
            log,
            index: RwLock::new(index),
            head: RwLock::new(head),
            commit_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            commits,
            _dir: dir,
        })
    }

    /// The configuration this store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Starts a new transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidOptions`] if `options` fail validation,
    /// [`StoreError::AlreadyClosed`] if the store is closed.
    pub fn new_tx(&self, options: TxOptions) -> StoreResult<OngoingTx<'_>> {
        options.validate()?;
        self.ensure_open()?;
        Ok(OngoingTx::new(self, options, self.snapshot()))
    }

    /// A read view at the latest committed transaction.
    ///
    /// Reads through the view fail once the store is closed.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            store: self,
            tx_id: self.head.read().tx_id,
            acquired_at: Instant::now(),
        }
    }

    /// The latest live value of `key`; deleted keys read as `None`.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyClosed`] if the store is closed.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<ValueRef>> {
        Ok(self.snapshot().get(key)?.filter(|v| !v.deleted))
    }

    /// Reads a committed transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::TxNotFound`] for id 0 or an id after the last commit,
    /// [`StoreError::AlreadyClosed`] if the store is closed.
    pub fn read_tx(&self, tx_id: TxId) -> StoreResult<Tx> {
        self.ensure_open()?;
        if tx_id.is_none() || tx_id > self.last_committed_tx_id() {
            return Err(StoreError::TxNotFound(tx_id));
        }
        self.log.read(tx_id)
    }

    /// Id of the last committed transaction, [`TxId::NONE`] if empty.
    #[must_use]
    pub fn last_committed_tx_id(&self) -> TxId {
        self.head.read().tx_id
    }

    /// `Alh` of the last committed transaction.
    #[must_use]
    pub fn last_alh(&self) -> Alh {
        self.head.read().alh
    }

    /// Watches the id of the last committed transaction.
    #[must_use]
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }

    /// Whether [`ImmuStore::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a durability failure stopped this store.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Appends a transaction committed elsewhere.
    ///
    /// Preconditions are not evaluated: the transaction is trusted to have
    /// passed them on the primary. Its structure and its link to the local
    /// chain are checked.
    ///
    /// # Errors
    ///
    /// - [`StoreError::TxOutOfOrder`] if the predecessor is not committed yet
    /// - [`StoreError::TxDiverged`] if a different transaction holds the id
    /// - [`StoreError::BrokenChain`] if `prev_alh` does not match the local head
    /// - [`StoreError::Corrupted`] if the header does not match the entries
    /// - [`StoreError::Durability`] if the append fails
    pub fn replicate_tx(&self, tx: Tx) -> StoreResult<ReplicateOutcome> {
        self.ensure_open()?;
        tx.verify()?;
        let id = tx.id();
        if id.is_none() {
            return Err(StoreError::corrupted("replicated transaction has id 0"));
        }

        let _gate = self.commit_gate.lock();
        self.ensure_writable()?;
        let head = *self.head.read();

        if id <= head.tx_id {
            let local = self.log.read(id)?;
            if local.alh() == tx.alh() {
                return Ok(ReplicateOutcome::AlreadyApplied(*local.header()));
            }
            return Err(StoreError::TxDiverged { tx_id: id });
        }
        if id != head.tx_id.next() {
            return Err(StoreError::TxOutOfOrder {
                expected: head.tx_id.next(),
                actual: id,
            });
        }
        head.check_successor(&tx)?;

        self.append_and_publish(&tx)?;
        tracing::trace!(tx_id = id.as_u64(), "replicated transaction");
        Ok(ReplicateOutcome::Applied(*tx.header()))
    }

    /// Re-reads the whole log and checks every transaction against its
    /// predecessor. Returns the last verified id.
    ///
    /// # Errors
    ///
    /// A fatal error naming the first transaction that does not verify.
    pub fn verify_chain(&self) -> StoreResult<TxId> {
        self.ensure_open()?;
        let last = *self.head.read();
        let mut head = Head::GENESIS;
        for id in 1..=last.tx_id.as_u64() {
            let tx = self.log.read(TxId(id))?;
            head.check_successor(&tx)?;
            head = Head::of(&tx);
        }
        if head.alh != last.alh {
            return Err(StoreError::BrokenChain { tx_id: last.tx_id });
        }
        Ok(head.tx_id)
    }

    /// Closes the store, waiting for an in-flight commit.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyClosed`] on a second close; otherwise any error
    /// from the final sync.
    pub fn close(&self) -> StoreResult<()> {
        let _gate = self.commit_gate.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::AlreadyClosed);
        }
        tracing::info!(
            last_tx_id = self.last_committed_tx_id().as_u64(),
            "store closed"
        );
        if self.is_halted() {
            return Ok(());
        }
        self.log.sync()
    }

    pub(crate) fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.is_halted() {
            return Err(StoreError::durability(
                "store halted after an earlier durability failure",
            ));
        }
        Ok(())
    }

    /// Runs the commit pipeline for a staged transaction.
    pub(crate) fn commit_staged(
        &self,
        snapshot: &mut Snapshot<'_>,
        renewal_period: Duration,
        preconditions: &[Precondition],
        entries: Vec<Entry>,
    ) -> StoreResult<TxHeader> {
        let _gate = self.commit_gate.lock();
        self.ensure_writable()?;
        let head = *self.head.read();

        if snapshot.tx_id < head.tx_id || snapshot.age() > renewal_period {
            tracing::trace!(
                from = snapshot.tx_id.as_u64(),
                to = head.tx_id.as_u64(),
                "renewing snapshot before precondition check"
            );
            snapshot.tx_id = head.tx_id;
            snapshot.acquired_at = Instant::now();
        }
        check_preconditions(
            preconditions.iter().map(Some),
            &*snapshot,
            self.config.max_key_len,
        )?;

        let tx = Tx::build(head.tx_id.next(), next_timestamp(head.timestamp), head.alh, entries);
        self.append_and_publish(&tx)?;
        tracing::trace!(tx_id = tx.id().as_u64(), entries = tx.entries().len(), "committed");
        Ok(*tx.header())
    }

    /// Appends under the commit gate, then makes the transaction visible.
    fn append_and_publish(&self, tx: &Tx) -> StoreResult<()> {
        if let Err(err) = self.log.append(tx, self.config.sync_on_commit) {
            if err.is_fatal() {
                self.halted.store(true, Ordering::SeqCst);
                tracing::error!(tx_id = tx.id().as_u64(), error = %err, "durability failure, store halted");
            } else {
                tracing::warn!(tx_id = tx.id().as_u64(), error = %err, "transaction refused by the log");
            }
            return Err(err);
        }
        // Index before head: a snapshot never sees a head without its entries.
        self.index.write().apply(tx);
        *self.head.write() = Head::of(tx);
        self.commits.send_replace(tx.id().as_u64());
        Ok(())
    }
}

impl fmt::Debug for ImmuStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmuStore")
            .field("last_tx_id", &self.last_committed_tx_id())
            .field("txs", &self.log.len())
            .field("closed", &self.is_closed())
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

fn next_timestamp(previous: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    now.max(previous)
}

/// A read view of the store at a committed transaction.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    store: &'a ImmuStore,
    tx_id: TxId,
    acquired_at: Instant,
}

impl Snapshot<'_> {
    /// The transaction this view reflects.
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Time since the view was acquired.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// The version of `key` visible in this view, including deletions.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyClosed`] if the store is closed.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<ValueRef>> {
        self.store.ensure_open()?;
        Ok(self.store.index.read().get_at(key, self.tx_id))
    }
}

impl SnapshotReader for Snapshot<'_> {
    fn ensure_readable(&self) -> StoreResult<()> {
        self.store.ensure_open()
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<ValueRef>> {
        Snapshot::get(self, key)
    }
}
