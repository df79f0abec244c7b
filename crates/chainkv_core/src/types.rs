//! Core identifiers.

use std::fmt;

/// A 32-byte SHA-256 digest.
pub type Alh = [u8; 32];

/// The `Alh` preceding the first transaction.
pub const ZERO_HASH: Alh = [0u8; 32];

/// Identifier of a committed transaction.
///
/// Ids start at 1 and are dense: the store assigns `last + 1` on every
/// commit. `TxId(0)` stands for "nothing committed yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxId(pub u64);

impl TxId {
    /// The id before the first transaction.
    pub const NONE: TxId = TxId(0);

    /// Creates a transaction id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The id that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The id that follows this one, or `None` at `u64::MAX`.
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Whether this is [`TxId::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

impl From<u64> for TxId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_and_step() {
        assert!(TxId::new(1) < TxId::new(2));
        assert_eq!(TxId::NONE.next(), TxId::new(1));
        assert!(TxId::default().is_none());
        assert_eq!(TxId::new(42).to_string(), "tx:42");
    }

    #[test]
    fn last_id_has_no_successor() {
        assert_eq!(TxId::new(7).checked_next(), Some(TxId::new(8)));
        assert_eq!(TxId::new(u64::MAX).checked_next(), None);
    }
}
