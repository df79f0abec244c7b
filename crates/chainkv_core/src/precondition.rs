//! Commit-time preconditions.
//!
//! A [`Precondition`] is registered on an [`OngoingTx`](crate::OngoingTx) and
//! evaluated against the latest committed state while the commit gate is
//! held. Evaluation of a list stops at the first entry that fails.

use crate::error::{PreconditionFault, StoreError, StoreResult};
use crate::index::ValueRef;
use crate::types::TxId;
use std::fmt;

/// Read access to committed state at a fixed point in the history.
pub trait SnapshotReader {
    /// Fails with [`StoreError::AlreadyClosed`] once the owning store is closed.
    fn ensure_readable(&self) -> StoreResult<()>;

    /// The latest committed version of `key` visible to this reader,
    /// including deletions.
    fn get(&self, key: &[u8]) -> StoreResult<Option<ValueRef>>;
}

/// The kind of a [`Precondition`], used to report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreconditionKind {
    /// See [`Precondition::KeyMustExist`].
    KeyMustExist,
    /// See [`Precondition::KeyMustNotExist`].
    KeyMustNotExist,
    /// See [`Precondition::KeyNotModifiedAfterTx`].
    KeyNotModifiedAfterTx,
}

impl fmt::Display for PreconditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeyMustExist => "KeyMustExist",
            Self::KeyMustNotExist => "KeyMustNotExist",
            Self::KeyNotModifiedAfterTx => "KeyNotModifiedAfterTx",
        })
    }
}

/// A condition that must hold for a transaction to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The key has a live (not deleted) value.
    KeyMustExist {
        /// Target key.
        key: Vec<u8>,
    },
    /// The key has no value or its latest version is a deletion.
    KeyMustNotExist {
        /// Target key.
        key: Vec<u8>,
    },
    /// No transaction after `tx_id` has written the key.
    KeyNotModifiedAfterTx {
        /// Target key.
        key: Vec<u8>,
        /// Upper bound for the last modification.
        tx_id: TxId,
    },
}

impl Precondition {
    /// Shorthand for [`Precondition::KeyMustExist`].
    pub fn key_must_exist(key: impl Into<Vec<u8>>) -> Self {
        Self::KeyMustExist { key: key.into() }
    }

    /// Shorthand for [`Precondition::KeyMustNotExist`].
    pub fn key_must_not_exist(key: impl Into<Vec<u8>>) -> Self {
        Self::KeyMustNotExist { key: key.into() }
    }

    /// Shorthand for [`Precondition::KeyNotModifiedAfterTx`].
    pub fn key_not_modified_after_tx(key: impl Into<Vec<u8>>, tx_id: TxId) -> Self {
        Self::KeyNotModifiedAfterTx {
            key: key.into(),
            tx_id,
        }
    }

    /// The kind of this precondition.
    #[must_use]
    pub fn kind(&self) -> PreconditionKind {
        match self {
            Self::KeyMustExist { .. } => PreconditionKind::KeyMustExist,
            Self::KeyMustNotExist { .. } => PreconditionKind::KeyMustNotExist,
            Self::KeyNotModifiedAfterTx { .. } => PreconditionKind::KeyNotModifiedAfterTx,
        }
    }

    /// The key this precondition is about.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::KeyMustExist { key }
            | Self::KeyMustNotExist { key }
            | Self::KeyNotModifiedAfterTx { key, .. } => key,
        }
    }

    /// Structural checks that do not need committed state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidPrecondition`] for an empty key or a key
    /// longer than `max_key_len`.
    pub fn validate(&self, max_key_len: usize) -> StoreResult<()> {
        let key = self.key();
        if key.is_empty() {
            return Err(StoreError::InvalidPrecondition(PreconditionFault::EmptyKey));
        }
        if key.len() > max_key_len {
            return Err(StoreError::InvalidPrecondition(
                PreconditionFault::KeyTooLong {
                    len: key.len(),
                    max: max_key_len,
                },
            ));
        }
        Ok(())
    }

    /// Whether the precondition holds in `snapshot`.
    ///
    /// # Errors
    ///
    /// Propagates read failures of the snapshot.
    pub fn evaluate(&self, snapshot: &dyn SnapshotReader) -> StoreResult<bool> {
        let current = snapshot.get(self.key())?;
        Ok(match self {
            Self::KeyMustExist { .. } => current.is_some_and(|v| !v.deleted),
            Self::KeyMustNotExist { .. } => current.map_or(true, |v| v.deleted),
            Self::KeyNotModifiedAfterTx { tx_id, .. } => {
                current.map_or(true, |v| v.tx_id <= *tx_id)
            }
        })
    }
}

/// Evaluates preconditions in order against `snapshot`.
///
/// Per entry: a missing precondition fails first, then a closed store, then
/// structural faults, then evaluation. An empty list always succeeds.
///
/// # Errors
///
/// - [`StoreError::InvalidPrecondition`] with [`PreconditionFault::Null`] for a `None` entry
/// - [`StoreError::AlreadyClosed`] if the snapshot's store is closed
/// - [`StoreError::InvalidPrecondition`] for a structurally invalid entry
/// - [`StoreError::PreconditionFailed`] for the first entry that does not hold
pub fn check_preconditions<'p, I>(
    preconditions: I,
    snapshot: &dyn SnapshotReader,
    max_key_len: usize,
) -> StoreResult<()>
where
    I: IntoIterator<Item = Option<&'p Precondition>>,
{
    for precondition in preconditions {
        let precondition =
            precondition.ok_or(StoreError::InvalidPrecondition(PreconditionFault::Null))?;
        snapshot.ensure_readable()?;
        precondition.validate(max_key_len)?;
        if !precondition.evaluate(snapshot)? {
            return Err(StoreError::PreconditionFailed {
                kind: precondition.kind(),
                key: precondition.key().to_vec(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct FixedSnapshot {
        closed: bool,
        values: HashMap<Vec<u8>, ValueRef>,
    }

    impl FixedSnapshot {
        fn with(mut self, key: &[u8], tx_id: u64, deleted: bool) -> Self {
            self.values.insert(
                key.to_vec(),
                ValueRef {
                    tx_id: TxId(tx_id),
                    value: Arc::from(&b"v"[..]),
                    deleted,
                },
            );
            self
        }
    }

    impl SnapshotReader for FixedSnapshot {
        fn ensure_readable(&self) -> StoreResult<()> {
            if self.closed {
                Err(StoreError::AlreadyClosed)
            } else {
                Ok(())
            }
        }

        fn get(&self, key: &[u8]) -> StoreResult<Option<ValueRef>> {
            self.ensure_readable()?;
            Ok(self.values.get(key).cloned())
        }
    }

    fn check(list: &[Option<Precondition>], snapshot: &FixedSnapshot) -> StoreResult<()> {
        check_preconditions(list.iter().map(Option::as_ref), snapshot, 16)
    }

    #[test]
    fn empty_list_always_passes() {
        let closed = FixedSnapshot {
            closed: true,
            ..Default::default()
        };
        assert!(check(&[], &FixedSnapshot::default()).is_ok());
        assert!(check(&[], &closed).is_ok());
    }

    #[test]
    fn null_entry_is_invalid_precondition() {
        let err = check(&[None], &FixedSnapshot::default()).unwrap_err();
        assert!(err.is_invalid_precondition());
        assert!(matches!(
            err,
            StoreError::InvalidPrecondition(PreconditionFault::Null)
        ));
    }

    #[test]
    fn closed_store_wins_over_structural_fault() {
        let closed = FixedSnapshot {
            closed: true,
            ..Default::default()
        };
        for p in [
            Precondition::key_must_exist(b"k".to_vec()),
            Precondition::key_must_not_exist(Vec::new()),
            Precondition::key_not_modified_after_tx(vec![b'x'; 64], TxId(1)),
        ] {
            assert!(matches!(
                check(&[Some(p)], &closed),
                Err(StoreError::AlreadyClosed)
            ));
        }
    }

    #[test]
    fn structural_faults_are_reported() {
        let snapshot = FixedSnapshot::default();
        assert!(matches!(
            check(&[Some(Precondition::key_must_exist(Vec::new()))], &snapshot),
            Err(StoreError::InvalidPrecondition(PreconditionFault::EmptyKey))
        ));
        assert!(matches!(
            check(&[Some(Precondition::key_must_exist(vec![1; 17]))], &snapshot),
            Err(StoreError::InvalidPrecondition(PreconditionFault::KeyTooLong { len: 17, max: 16 }))
        ));
    }

    #[test]
    fn existence_checks_treat_deletions_as_absent() {
        let snapshot = FixedSnapshot::default()
            .with(b"live", 1, false)
            .with(b"dead", 2, true);

        assert!(check(&[Some(Precondition::key_must_exist(b"live".to_vec()))], &snapshot).is_ok());
        assert!(check(&[Some(Precondition::key_must_not_exist(b"dead".to_vec()))], &snapshot).is_ok());
        assert!(check(&[Some(Precondition::key_must_not_exist(b"none".to_vec()))], &snapshot).is_ok());

        let err = check(&[Some(Precondition::key_must_exist(b"dead".to_vec()))], &snapshot).unwrap_err();
        match err {
            StoreError::PreconditionFailed { kind, key } => {
                assert_eq!(kind, PreconditionKind::KeyMustExist);
                assert_eq!(key, b"dead");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn not_modified_after_compares_last_writer() {
        let snapshot = FixedSnapshot::default().with(b"k", 5, false);
        let at = |id| Some(Precondition::key_not_modified_after_tx(b"k".to_vec(), TxId(id)));

        assert!(check(&[at(5)], &snapshot).is_ok());
        assert!(check(&[at(9)], &snapshot).is_ok());
        assert!(check(&[at(4)], &snapshot).unwrap_err().is_precondition_failure());
    }

    #[test]
    fn first_violation_stops_evaluation() {
        let snapshot = FixedSnapshot::default();
        let err = check(
            &[
                Some(Precondition::key_must_exist(b"a".to_vec())),
                None,
            ],
            &snapshot,
        )
        .unwrap_err();
        assert!(err.is_precondition_failure());
    }
}
