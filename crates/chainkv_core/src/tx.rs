//! Committed transactions and their hashes.
//!
//! Every transaction carries a header that binds it to its predecessor:
//!
//! ```text
//! entry_digest = H(key_len || key || deleted || H(value))
//! entries_hash = H(entry_digest_1 || ... || entry_digest_k)
//! inner_hash   = H(timestamp || version || entries_count || entries_hash)
//! alh(n)       = H(id || alh(n-1) || inner_hash)
//! ```
//!
//! Integers are hashed little-endian. `alh(0)` is [`ZERO_HASH`](crate::ZERO_HASH).

use crate::error::{StoreError, StoreResult};
use crate::types::{Alh, TxId};
use sha2::{Digest, Sha256};

/// Header layout version written by this crate.
pub const TX_HEADER_VERSION: u16 = 1;

/// Per-entry metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// The entry is a logical deletion of its key.
    pub deleted: bool,
}

/// One key/value write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
    metadata: EntryMetadata,
}

impl Entry {
    /// Creates a write of `value` under `key`.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: EntryMetadata::default(),
        }
    }

    /// Creates a logical deletion of `key`.
    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            metadata: EntryMetadata { deleted: true },
        }
    }

    pub(crate) fn with_metadata(key: Vec<u8>, value: Vec<u8>, metadata: EntryMetadata) -> Self {
        Self {
            key,
            value,
            metadata,
        }
    }

    /// The key.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value (empty for deletions).
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Entry metadata.
    #[must_use]
    pub fn metadata(&self) -> EntryMetadata {
        self.metadata
    }

    /// Whether this entry deletes its key.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.metadata.deleted
    }

    /// Digest of this entry as it contributes to `entries_hash`.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let value_hash: [u8; 32] = Sha256::digest(&self.value).into();
        let mut hasher = Sha256::new();
        hasher.update((self.key.len() as u32).to_le_bytes());
        hasher.update(&self.key);
        hasher.update([u8::from(self.metadata.deleted)]);
        hasher.update(value_hash);
        hasher.finalize().into()
    }
}

/// Hash over the ordered entries of a transaction.
#[must_use]
pub fn entries_hash(entries: &[Entry]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.digest());
    }
    hasher.finalize().into()
}

/// Header of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHeader {
    /// Transaction id.
    pub id: TxId,
    /// Commit time, microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Header layout version.
    pub version: u16,
    /// `Alh` of the previous transaction.
    pub prev_alh: Alh,
    /// Number of entries.
    pub entries_count: u32,
    /// Hash over the ordered entries.
    pub entries_hash: [u8; 32],
}

impl TxHeader {
    /// Hash of everything in the header except the chain link.
    #[must_use]
    pub fn inner_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.entries_count.to_le_bytes());
        hasher.update(self.entries_hash);
        hasher.finalize().into()
    }

    /// Accumulated linear hash of this transaction.
    #[must_use]
    pub fn alh(&self) -> Alh {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_u64().to_le_bytes());
        hasher.update(self.prev_alh);
        hasher.update(self.inner_hash());
        hasher.finalize().into()
    }
}

/// A committed transaction: header plus entries ordered by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    header: TxHeader,
    entries: Vec<Entry>,
}

impl Tx {
    /// Builds a transaction, computing its header hashes.
    ///
    /// `entries` must already be ordered by key.
    #[must_use]
    pub fn build(id: TxId, timestamp: u64, prev_alh: Alh, entries: Vec<Entry>) -> Self {
        let header = TxHeader {
            id,
            timestamp,
            version: TX_HEADER_VERSION,
            prev_alh,
            entries_count: entries.len() as u32,
            entries_hash: entries_hash(&entries),
        };
        Self { header, entries }
    }

    /// Reassembles a transaction from decoded parts without checking it.
    ///
    /// Call [`Tx::verify`] before trusting the result.
    #[must_use]
    pub fn from_parts(header: TxHeader, entries: Vec<Entry>) -> Self {
        Self { header, entries }
    }

    /// The header.
    #[must_use]
    pub fn header(&self) -> &TxHeader {
        &self.header
    }

    /// Entries ordered by key.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TxId {
        self.header.id
    }

    /// Accumulated linear hash.
    #[must_use]
    pub fn alh(&self) -> Alh {
        self.header.alh()
    }

    /// Checks that the header matches the entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupted`] if the version is unknown, the
    /// entry count or hash does not match, or keys are not strictly ordered.
    pub fn verify(&self) -> StoreResult<()> {
        let id = self.header.id;
        if self.header.version != TX_HEADER_VERSION {
            return Err(StoreError::corrupted(format!(
                "{id}: unsupported header version {}",
                self.header.version
            )));
        }
        if self.header.entries_count as usize != self.entries.len() {
            return Err(StoreError::corrupted(format!(
                "{id}: header declares {} entries, found {}",
                self.header.entries_count,
                self.entries.len()
            )));
        }
        if self.entries.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(StoreError::corrupted(format!(
                "{id}: entries are not strictly ordered by key"
            )));
        }
        if entries_hash(&self.entries) != self.header.entries_hash {
            return Err(StoreError::corrupted(format!("{id}: entries hash mismatch")));
        }
        Ok(())
    }
}
