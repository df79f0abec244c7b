//! Per-transaction options.

use crate::error::{StoreError, StoreResult};
use std::fmt;
use std::time::Duration;

/// Default age after which a transaction's read snapshot is re-acquired.
pub const DEFAULT_SNAPSHOT_RENEWAL_PERIOD: Duration = Duration::from_secs(1);

/// Access mode of an [`OngoingTx`](crate::OngoingTx).
///
/// Modes are small integers so that values received from outside the
/// process can be represented and rejected by [`TxOptions::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxMode(u8);

impl TxMode {
    /// Reads only; commit is rejected.
    pub const READ_ONLY: TxMode = TxMode(1);
    /// Writes only; reads are rejected.
    pub const WRITE_ONLY: TxMode = TxMode(2);
    /// Reads and writes.
    pub const READ_WRITE: TxMode = TxMode(3);

    /// Wraps a raw mode value.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// The raw value.
    #[must_use]
    pub const fn as_raw(self) -> u8 {
        self.0
    }

    /// Whether this is one of the known modes.
    #[must_use]
    pub const fn is_known(self) -> bool {
        matches!(self.0, 1..=3)
    }

    /// Whether the mode allows reads.
    #[must_use]
    pub const fn can_read(self) -> bool {
        self.0 == Self::READ_ONLY.0 || self.0 == Self::READ_WRITE.0
    }

    /// Whether the mode allows writes.
    #[must_use]
    pub const fn can_write(self) -> bool {
        self.0 == Self::WRITE_ONLY.0 || self.0 == Self::READ_WRITE.0
    }
}

impl From<u8> for TxMode {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::READ_ONLY => f.write_str("read-only"),
            Self::WRITE_ONLY => f.write_str("write-only"),
            Self::READ_WRITE => f.write_str("read-write"),
            Self(other) => write!(f, "unknown({other})"),
        }
    }
}

/// Options for [`ImmuStore::new_tx`](crate::ImmuStore::new_tx).
///
/// `TxOptions::default()` is unset and fails validation; start from
/// [`TxOptions::read_write`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    /// Access mode.
    pub mode: TxMode,
    /// Maximum age of the read snapshot before it is re-acquired.
    pub snapshot_renewal_period: Duration,
}

impl TxOptions {
    /// Read-write options with the default renewal period.
    #[must_use]
    pub fn read_write() -> Self {
        Self::with_mode(TxMode::READ_WRITE)
    }

    /// Read-only options with the default renewal period.
    #[must_use]
    pub fn read_only() -> Self {
        Self::with_mode(TxMode::READ_ONLY)
    }

    /// Write-only options with the default renewal period.
    #[must_use]
    pub fn write_only() -> Self {
        Self::with_mode(TxMode::WRITE_ONLY)
    }

    /// Options with `mode` and the default renewal period.
    #[must_use]
    pub fn with_mode(mode: impl Into<TxMode>) -> Self {
        Self {
            mode: mode.into(),
            snapshot_renewal_period: DEFAULT_SNAPSHOT_RENEWAL_PERIOD,
        }
    }

    /// Sets the snapshot renewal period.
    #[must_use]
    pub fn snapshot_renewal_period(mut self, period: Duration) -> Self {
        self.snapshot_renewal_period = period;
        self
    }

    /// Checks the options.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidOptions`] for an unknown mode or a zero
    /// renewal period.
    pub fn validate(&self) -> StoreResult<()> {
        if !self.mode.is_known() {
            return Err(StoreError::invalid_options(format!(
                "unknown transaction mode {}",
                self.mode.as_raw()
            )));
        }
        if self.snapshot_renewal_period.is_zero() {
            return Err(StoreError::invalid_options(
                "snapshot renewal period must be positive",
            ));
        }
        Ok(())
    }

    /// Validates optional options; absent options are invalid.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidOptions`] if `options` is `None` or
    /// fails [`TxOptions::validate`].
    pub fn validate_opt(options: Option<&TxOptions>) -> StoreResult<()> {
        options
            .ok_or_else(|| StoreError::invalid_options("options not provided"))?
            .validate()
    }
}
