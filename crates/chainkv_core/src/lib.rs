//! # chainkv core
//!
//! The append-only transaction engine behind chainkv.
//!
//! This crate provides:
//! - [`OngoingTx`], the single-owner buffer where writes and
//!   [`Precondition`]s are staged
//! - [`ImmuStore`], which serializes commits, evaluates preconditions against
//!   the latest committed state, assigns dense [`TxId`]s and chains every
//!   transaction to its predecessor through an accumulated linear hash
//! - the checksummed on-disk tx log and its recovery
//! - the replica commit path ([`ImmuStore::replicate_tx`]) that appends
//!   transactions validated by a primary
//!
//! ```rust
//! use chainkv_core::{ImmuStore, Precondition, StoreConfig, TxOptions};
//!
//! let store = ImmuStore::open_in_memory(StoreConfig::default()).unwrap();
//!
//! let mut tx = store.new_tx(TxOptions::read_write()).unwrap();
//! tx.set(b"balance", b"100").unwrap();
//! tx.add_precondition(Some(Precondition::key_must_not_exist(b"balance"))).unwrap();
//! let header = tx.commit().unwrap();
//!
//! assert_eq!(header.id.as_u64(), 1);
//! assert_eq!(store.read_tx(header.id).unwrap().alh(), header.alh());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
mod config;
mod dir;
mod error;
mod index;
mod log;
mod ongoing;
mod options;
mod precondition;
mod store;
mod tx;
mod types;

pub use config::StoreConfig;
pub use error::{PreconditionFault, StoreError, StoreResult};
pub use index::ValueRef;
pub use ongoing::{OngoingTx, TxState};
pub use options::{TxMode, TxOptions, DEFAULT_SNAPSHOT_RENEWAL_PERIOD};
pub use precondition::{check_preconditions, Precondition, PreconditionKind, SnapshotReader};
pub use store::{ImmuStore, ReplicateOutcome, Snapshot};
pub use tx::{entries_hash, Entry, EntryMetadata, Tx, TxHeader, TX_HEADER_VERSION};
pub use types::{Alh, TxId, ZERO_HASH};
