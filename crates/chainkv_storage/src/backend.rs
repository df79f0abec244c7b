//! The backend trait.

use crate::error::StorageResult;
use std::sync::Arc;

/// An append-only byte store.
///
/// # Invariants
///
/// - `append` returns the offset of the first written byte and never
///   rewrites earlier bytes
/// - `read_at` returns exactly what was appended at that offset
/// - after `flush` returns `Ok`, everything appended before it survives a
///   process crash; `sync` additionally persists file metadata
/// - `truncate` only shrinks; it exists to drop a torn tail on recovery or a
///   record whose durability write failed
///
/// Implementations synchronize internally, so all methods take `&self`.
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Makes all appended data durable.
    fn flush(&self) -> StorageResult<()>;

    /// Makes all appended data and metadata durable.
    fn sync(&self) -> StorageResult<()>;

    /// Current size in bytes, i.e. the offset of the next append.
    fn size(&self) -> StorageResult<u64>;

    /// Shrinks the backend to `new_size` bytes.
    fn truncate(&self, new_size: u64) -> StorageResult<()>;
}

macro_rules! forward_backend {
    ($($ptr:ident),*) => {$(
        impl<B: StorageBackend + ?Sized> StorageBackend for $ptr<B> {
            fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
                (**self).read_at(offset, len)
            }

            fn append(&self, data: &[u8]) -> StorageResult<u64> {
                (**self).append(data)
            }

            fn flush(&self) -> StorageResult<()> {
                (**self).flush()
            }

            fn sync(&self) -> StorageResult<()> {
                (**self).sync()
            }

            fn size(&self) -> StorageResult<u64> {
                (**self).size()
            }

            fn truncate(&self, new_size: u64) -> StorageResult<()> {
                (**self).truncate(new_size)
            }
        }
    )*};
}

forward_backend!(Box, Arc);
