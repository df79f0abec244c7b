//! Transaction export.
//!
//! A [`TxStream`] reads the durable log independently of the commit path:
//! it never holds the commit gate and only sees transactions after they
//! became visible. Streams are lazy and infinite; when caught up they wait
//! for the next commit.

use crate::config::ExporterConfig;
use crate::error::{PrimaryError, PrimaryResult};
use chainkv_core::codec::{encode_tx, MAX_TX_PAYLOAD_LEN};
use chainkv_core::{ImmuStore, TxId};
use chainkv_repl_protocol::{Chunk, MAX_FRAME_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// A full chunk plus its message envelope must fit in one frame.
const _: () = assert!(MAX_TX_PAYLOAD_LEN < MAX_FRAME_SIZE);

/// Creates transaction streams over a store.
#[derive(Debug, Clone)]
pub struct TxExporter {
    store: Arc<ImmuStore>,
    config: ExporterConfig,
}

impl TxExporter {
    /// Creates an exporter.
    pub fn new(store: Arc<ImmuStore>, config: ExporterConfig) -> Self {
        Self { store, config }
    }

    /// The exported store.
    #[must_use]
    pub fn store(&self) -> &Arc<ImmuStore> {
        &self.store
    }

    /// A stream whose first chunk starts at `tx_id`.
    ///
    /// `TxId::NONE` is treated as the start of the log.
    #[must_use]
    pub fn stream_from(&self, tx_id: TxId) -> TxStream {
        TxStream {
            store: Arc::clone(&self.store),
            commits: self.store.subscribe_commits(),
            position: if tx_id.is_none() { TxId(1) } else { tx_id },
            max_chunk_bytes: self.config.max_chunk_bytes.min(MAX_TX_PAYLOAD_LEN),
            lookahead: None,
        }
    }
}

/// A forward-only stream of chunks.
#[derive(Debug)]
pub struct TxStream {
    store: Arc<ImmuStore>,
    commits: watch::Receiver<u64>,
    position: TxId,
    max_chunk_bytes: usize,
    /// The payload that overflowed the previous chunk.
    lookahead: Option<(TxId, Vec<u8>)>,
}

impl TxStream {
    /// Id of the next transaction the stream will produce.
    #[must_use]
    pub fn position(&self) -> TxId {
        self.position
    }

    /// The next chunk if any transaction is available, without waiting.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn try_next_chunk(&mut self) -> PrimaryResult<Option<Chunk>> {
        self.cut_chunk(self.max_chunk_bytes)
    }

    /// The next chunk, waiting for a commit if the stream is caught up.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub async fn next_chunk(&mut self) -> PrimaryResult<Chunk> {
        loop {
            if let Some(chunk) = self.cut_chunk(self.max_chunk_bytes)? {
                return Ok(chunk);
            }
            // The sender lives inside the store, which this stream keeps alive.
            if self.commits.changed().await.is_err() {
                return Err(PrimaryError::Store(chainkv_core::StoreError::AlreadyClosed));
            }
        }
    }

    /// Serves a fetch at `offset`.
    ///
    /// Moving forward skips transactions; moving backwards is rejected.
    /// When no transaction is available within `wait`, an empty chunk is
    /// returned. `max_bytes == 0` uses the stream's configured limit.
    ///
    /// # Errors
    ///
    /// [`PrimaryError::InvalidPreviousOffset`] if `offset` is behind the
    /// stream position; store read errors.
    pub async fn fetch(
        &mut self,
        offset: TxId,
        max_bytes: usize,
        wait: Duration,
    ) -> PrimaryResult<Chunk> {
        if offset < self.position {
            return Err(PrimaryError::InvalidPreviousOffset {
                requested: offset,
                position: self.position,
            });
        }
        self.position = offset;

        let limit = match max_bytes {
            0 => self.max_chunk_bytes,
            n => n.min(self.max_chunk_bytes),
        };
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(chunk) = self.cut_chunk(limit)? {
                return Ok(chunk);
            }
            match tokio::time::timeout_at(deadline, self.commits.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(self.empty_chunk()),
            }
        }
    }

    fn empty_chunk(&self) -> Chunk {
        Chunk {
            first_tx_id: self.position.as_u64(),
            txs: Vec::new(),
            primary_last_tx_id: self.store.last_committed_tx_id().as_u64(),
        }
    }

    fn cut_chunk(&mut self, max_bytes: usize) -> PrimaryResult<Option<Chunk>> {
        let last = self.store.last_committed_tx_id();
        if self.position > last {
            return Ok(None);
        }

        let first = self.position;
        let mut carried = self.lookahead.take().filter(|(id, _)| *id == first);
        let mut txs = Vec::new();
        let mut bytes = 0usize;
        let mut next = first;
        while next <= last {
            let payload = match carried.take() {
                Some((_, payload)) => payload,
                None => self.export_tx(next)?,
            };
            if !txs.is_empty() && bytes + payload.len() > max_bytes {
                self.lookahead = Some((next, payload));
                break;
            }
            bytes += payload.len();
            txs.push(payload);
            next = next.next();
        }

        self.position = next;
        tracing::trace!(
            first = first.as_u64(),
            count = txs.len(),
            bytes,
            "cut chunk"
        );
        Ok(Some(Chunk {
            first_tx_id: first.as_u64(),
            txs,
            primary_last_tx_id: last.as_u64(),
        }))
    }

    fn export_tx(&self, tx_id: TxId) -> PrimaryResult<Vec<u8>> {
        let payload = encode_tx(&self.store.read_tx(tx_id)?);
        if payload.len() > MAX_TX_PAYLOAD_LEN {
            tracing::error!(
                tx_id = tx_id.as_u64(),
                len = payload.len(),
                "transaction too large to replicate"
            );
            return Err(PrimaryError::TxTooLarge {
                tx_id,
                len: payload.len(),
            });
        }
        Ok(payload)
    }
}
