//! The replication applier.

use crate::delayer::Delayer;
use crate::error::{ReplicationError, ReplicationResult};
use crate::options::ReplicationOptions;
use crate::state::{ReplicaState, ReplicatorStats};
use crate::transport::{PrimaryConnector, PrimarySession};
use chainkv_core::{codec, ImmuStore, ReplicateOutcome, StoreError, Tx, TxId};
use chainkv_repl_protocol::{FetchRequest, HandshakeRequest, ProtocolError};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A fetched transaction payload and the id its chunk position implies.
type Fetched = ReplicationResult<(TxId, Vec<u8>)>;

/// A decoded, verified transaction still holding its concurrency slot.
struct Prepared {
    tx: Tx,
    permit: OwnedSemaphorePermit,
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct FetchPlan {
    session_token: Vec<u8>,
    next: TxId,
    max_bytes: u32,
    wait_ms: u32,
}

/// Follows a primary and replays its transactions into a local store.
///
/// `run` drives the whole lifecycle; `stop` ends it from another task.
pub struct TxReplicator<C> {
    store: Arc<ImmuStore>,
    options: ReplicationOptions,
    delayer: Arc<dyn Delayer>,
    connector: C,
    state: RwLock<ReplicaState>,
    stats: RwLock<ReplicatorStats>,
    stop: watch::Sender<bool>,
}

impl<C: PrimaryConnector> TxReplicator<C> {
    /// Creates a replicator writing into `store`.
    ///
    /// # Errors
    ///
    /// [`ReplicationError::InvalidOptions`] if `options` are not valid.
    pub fn new(
        store: Arc<ImmuStore>,
        options: ReplicationOptions,
        connector: C,
    ) -> ReplicationResult<Self> {
        options.validate()?;
        let delayer = options
            .delayer
            .clone()
            .ok_or_else(|| ReplicationError::invalid_options("a delayer is required"))?;
        let stats = ReplicatorStats {
            last_applied_tx_id: store.last_committed_tx_id(),
            ..ReplicatorStats::default()
        };
        let (stop, _) = watch::channel(false);
        Ok(Self {
            store,
            options,
            delayer,
            connector,
            state: RwLock::new(ReplicaState::Disconnected),
            stats: RwLock::new(stats),
            stop,
        })
    }

    /// The local store.
    pub fn store(&self) -> &Arc<ImmuStore> {
        &self.store
    }

    /// The options in use.
    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    /// The connector in use.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicaState {
        *self.state.read()
    }

    /// A copy of the counters.
    pub fn stats(&self) -> ReplicatorStats {
        self.stats.read().clone()
    }

    /// Asks `run` to return. Takes effect at the next await point.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Replicates until stopped or until an error retrying cannot fix.
    ///
    /// Transport failures move the replica to `Disconnected` and it
    /// reconnects after the delay its [`Delayer`] computes for the number of
    /// consecutive failures. A completed handshake resets that count.
    ///
    /// # Errors
    ///
    /// The first non-retryable error, after which the state is `Failed`.
    pub async fn run(&self) -> ReplicationResult<()> {
        info!(
            replica_id = %self.options.replica_id,
            from = %self.store.last_committed_tx_id().next(),
            "replica starting"
        );
        let mut attempt = 0u32;
        loop {
            if self.is_stopped() {
                break;
            }
            self.set_state(ReplicaState::Connecting);
            let outcome = tokio::select! {
                () = self.stopped() => break,
                outcome = self.follow(&mut attempt) => outcome,
            };
            let err = match outcome {
                Ok(()) => break,
                Err(err) => err,
            };
            self.stats.write().last_error = Some(err.to_string());

            if !err.is_retryable() {
                self.set_state(ReplicaState::Failed);
                error!(error = %err, "replication failed");
                return Err(err);
            }

            self.set_state(ReplicaState::Disconnected);
            let delay = self.delayer.delay_after(attempt);
            attempt = attempt.saturating_add(1);
            self.stats.write().retries += 1;
            warn!(attempt, ?delay, error = %err, "replication interrupted, retrying");
            tokio::select! {
                () = self.stopped() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ReplicaState::Stopped);
        info!(
            last_applied = %self.store.last_committed_tx_id(),
            "replica stopped"
        );
        Ok(())
    }

    fn set_state(&self, state: ReplicaState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(?previous, ?state, "replica state changed");
        }
    }

    async fn stopped(&self) {
        let mut stop = self.stop.subscribe();
        loop {
            let stopped = *stop.borrow_and_update();
            if stopped || stop.changed().await.is_err() {
                return;
            }
        }
    }

    /// One session: connect, handshake, then apply until the stream breaks.
    async fn follow(&self, attempt: &mut u32) -> ReplicationResult<()> {
        self.stats.write().connection_attempts += 1;
        let mut session = self.connector.connect(&self.options).await?;

        let last_applied = self.store.last_committed_tx_id();
        let request = HandshakeRequest::new(
            self.options.replica_id,
            self.options.credentials(),
            last_applied.as_u64(),
        );
        let response = session.handshake(request).await?;
        if !response.accepted {
            return Err(ReplicationError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        *attempt = 0;
        self.stats.write().sessions += 1;
        self.set_state(ReplicaState::Streaming);
        info!(
            from = %last_applied.next(),
            primary_last = response.primary_last_tx_id,
            "replication session open"
        );

        let plan = FetchPlan {
            session_token: response.session_token,
            next: last_applied.next(),
            max_bytes: u32::try_from(self.options.stream_chunk_size).unwrap_or(u32::MAX),
            wait_ms: u32::try_from(self.options.fetch_wait.as_millis()).unwrap_or(u32::MAX),
        };
        let (sender, receiver) = mpsc::channel(self.options.prefetch_tx_buffer_size);
        let _prefetch = AbortOnDrop(tokio::spawn(prefetch(session, plan, sender)));
        self.apply(receiver).await
    }

    /// Prepares fetched transactions concurrently and commits them in order.
    ///
    /// Each transaction holds a semaphore permit from the moment it is
    /// handed to a preparation task until it is committed, so at most
    /// `replication_commit_concurrency` are in flight.
    async fn apply(&self, mut receiver: mpsc::Receiver<Fetched>) -> ReplicationResult<()> {
        let permits = Arc::new(Semaphore::new(self.options.replication_commit_concurrency));
        let mut pending: VecDeque<JoinHandle<ReplicationResult<Prepared>>> = VecDeque::new();
        let mut interrupted: Option<ReplicationError> = None;

        loop {
            while interrupted.is_none() {
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    break;
                };
                match receiver.try_recv() {
                    Ok(Ok((tx_id, payload))) => {
                        pending.push_back(spawn_prepare(tx_id, payload, permit));
                    }
                    Ok(Err(err)) => interrupted = Some(err),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        interrupted = Some(ProtocolError::ConnectionClosed.into());
                    }
                }
            }

            if let Some(task) = pending.pop_front() {
                let prepared = task
                    .await
                    .map_err(|e| ReplicationError::Task(e.to_string()))??;
                self.commit(prepared).await?;
                continue;
            }

            // Everything received so far is committed.
            if let Some(err) = interrupted.take() {
                return Err(err);
            }

            match receiver.recv().await {
                Some(Ok((tx_id, payload))) => {
                    let permit = Arc::clone(&permits)
                        .acquire_owned()
                        .await
                        .map_err(|e| ReplicationError::Task(e.to_string()))?;
                    pending.push_back(spawn_prepare(tx_id, payload, permit));
                }
                Some(Err(err)) => interrupted = Some(err),
                None => interrupted = Some(ProtocolError::ConnectionClosed.into()),
            }
        }
    }

    async fn commit(&self, prepared: Prepared) -> ReplicationResult<()> {
        let Prepared { tx, permit } = prepared;
        let tx_id = tx.id();
        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || store.replicate_tx(tx))
            .await
            .map_err(|e| ReplicationError::Task(e.to_string()))?;
        drop(permit);

        match outcome {
            Ok(ReplicateOutcome::Applied(_)) => {
                let mut stats = self.stats.write();
                stats.txs_applied += 1;
                stats.last_applied_tx_id = tx_id;
            }
            Ok(ReplicateOutcome::AlreadyApplied(_)) => {
                debug!(%tx_id, "transaction already applied");
                let mut stats = self.stats.write();
                stats.txs_skipped += 1;
                stats.last_applied_tx_id = stats.last_applied_tx_id.max(tx_id);
            }
            Err(StoreError::TxDiverged { tx_id }) if self.options.allow_tx_discarding => {
                warn!(%tx_id, "discarding transaction that diverges from local history");
                self.stats.write().txs_discarded += 1;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

impl<C> fmt::Debug for TxReplicator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxReplicator")
            .field("options", &self.options)
            .field("state", &*self.state.read())
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}

/// Keeps the channel topped up with transactions in chunk order.
///
/// A chunk may start before the requested id but never after it. Ends after
/// forwarding the first error, or when the applier hangs up.
async fn prefetch<S: PrimarySession>(
    mut session: S,
    mut plan: FetchPlan,
    sender: mpsc::Sender<Fetched>,
) {
    loop {
        let request = FetchRequest {
            session_token: plan.session_token.clone(),
            from_tx_id: plan.next.as_u64(),
            max_bytes: plan.max_bytes,
            wait_ms: plan.wait_ms,
        };
        let chunk = match session.fetch(request).await {
            Ok(chunk) if chunk.first_tx_id <= plan.next.as_u64() => chunk,
            Ok(chunk) => {
                let err = StoreError::TxOutOfOrder {
                    expected: plan.next,
                    actual: TxId(chunk.first_tx_id),
                };
                let _ = sender.send(Err(err.into())).await;
                return;
            }
            Err(err) => {
                let _ = sender.send(Err(err)).await;
                return;
            }
        };

        // Overlapping ids are forwarded too; the applier skips or rejects
        // them by comparing hashes.
        let next = plan.next.max(TxId(chunk.next_tx_id()));
        for (tx_id, payload) in (chunk.first_tx_id..).map(TxId).zip(chunk.txs) {
            if sender.send(Ok((tx_id, payload))).await.is_err() {
                return;
            }
        }
        plan.next = next;
    }
}

fn spawn_prepare(
    tx_id: TxId,
    payload: Vec<u8>,
    permit: OwnedSemaphorePermit,
) -> JoinHandle<ReplicationResult<Prepared>> {
    tokio::task::spawn_blocking(move || {
        let tx = prepare(tx_id, &payload)?;
        Ok(Prepared { tx, permit })
    })
}

/// Decodes a payload and checks it hashes to what its header claims.
fn prepare(expected: TxId, payload: &[u8]) -> ReplicationResult<Tx> {
    let tx = codec::decode_tx(payload)?;
    tx.verify()?;
    if tx.id() != expected {
        return Err(StoreError::corrupted(format!(
            "chunk slot {expected} carries {}",
            tx.id()
        ))
        .into());
    }
    Ok(tx)
}
