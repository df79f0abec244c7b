//! Store directory layout.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK      # advisory lock, one process per store
//! └─ txs.log   # append-only tx log
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const TX_LOG_FILE: &str = "txs.log";

/// An opened store directory. The lock is held until drop.
#[derive(Debug)]
pub(crate) struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    pub(crate) fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(StoreError::illegal_arguments(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(StoreError::illegal_arguments(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn tx_log_path(&self) -> PathBuf {
        self.path.join(TX_LOG_FILE)
    }
}
