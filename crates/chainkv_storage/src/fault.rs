//! Fault injection for durability tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared switches controlling which operations a [`FaultyBackend`] fails.
#[derive(Debug, Default)]
pub struct FaultSwitch {
    fail_append: AtomicBool,
    fail_flush: AtomicBool,
}

impl FaultSwitch {
    /// Creates a switch with every fault disarmed.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms or disarms failures of `append`.
    pub fn fail_append(&self, on: bool) {
        self.fail_append.store(on, Ordering::SeqCst);
    }

    /// Arms or disarms failures of `flush` and `sync`.
    pub fn fail_flush(&self, on: bool) {
        self.fail_flush.store(on, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, operation: &'static str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Injected { operation })
        } else {
            Ok(())
        }
    }
}

/// Wraps a backend and fails operations while the matching switch is armed.
pub struct FaultyBackend<B> {
    inner: B,
    switch: Arc<FaultSwitch>,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner`, controlled by `switch`.
    pub fn new(inner: B, switch: Arc<FaultSwitch>) -> Self {
        Self { inner, switch }
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        self.switch.check(&self.switch.fail_append, "append")?;
        self.inner.append(data)
    }

    fn flush(&self) -> StorageResult<()> {
        self.switch.check(&self.switch.fail_flush, "flush")?;
        self.inner.flush()
    }

    fn sync(&self) -> StorageResult<()> {
        self.switch.check(&self.switch.fail_flush, "sync")?;
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

impl<B> std::fmt::Debug for FaultyBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyBackend")
            .field("switch", &self.switch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;

    #[test]
    fn faults_follow_the_switch() {
        let switch = FaultSwitch::new();
        let backend = FaultyBackend::new(InMemoryBackend::new(), Arc::clone(&switch));

        backend.append(b"ok").unwrap();
        backend.flush().unwrap();

        switch.fail_flush(true);
        assert!(matches!(
            backend.flush(),
            Err(StorageError::Injected { operation: "flush" })
        ));
        assert!(backend.sync().is_err());
        backend.append(b"still appends").unwrap();

        switch.fail_append(true);
        assert!(backend.append(b"x").is_err());

        switch.fail_append(false);
        switch.fail_flush(false);
        backend.flush().unwrap();
        assert_eq!(backend.size().unwrap(), 15);
    }
}
