//! # chainkv replica
//!
//! Follows a primary and replays its committed transactions into a local
//! [`ImmuStore`](chainkv_core::ImmuStore).
//!
//! ## State machine
//!
//! ```text
//! Disconnected -> Connecting -> Streaming
//!       ^              |            |
//!       +-- backoff ---+-- error ---+
//!
//! stop()          -> Stopped
//! integrity error -> Failed
//! ```
//!
//! While streaming, a prefetch task keeps up to `prefetch_tx_buffer_size`
//! transactions buffered ahead of the applier. Up to
//! `replication_commit_concurrency` transactions are decoded and verified in
//! parallel, but they are appended strictly in ascending id order through
//! [`ImmuStore::replicate_tx`](chainkv_core::ImmuStore::replicate_tx).
//!
//! Transport failures are retried forever, spaced by the configured
//! [`Delayer`]. A broken hash chain, a corrupted transaction or divergent
//! history (unless discarding is allowed) stops the replica for good.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod delayer;
mod error;
mod options;
mod replicator;
mod state;
mod transport;

pub use delayer::{Delayer, ExpBackoff};
pub use error::{ReplicationError, ReplicationResult};
pub use options::{
    ReplicationOptions, DEFAULT_CHUNK_SIZE, DEFAULT_FETCH_WAIT, DEFAULT_PREFETCH_TX_BUFFER_SIZE,
    DEFAULT_REPLICATION_COMMIT_CONCURRENCY,
};
pub use replicator::TxReplicator;
pub use state::{ReplicaState, ReplicatorStats};
pub use transport::{
    FramedSession, LoopbackConnector, PrimaryConnector, PrimarySession, TcpConnector,
};
