//! Single-file backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An append-only file.
///
/// `flush` maps to `File::sync_data` because a committed transaction is only
/// acknowledged once its record is on disk; `sync` maps to `File::sync_all`.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens `path`, creating the file and its parent directories if needed.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileState { file, size }),
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let end = offset.saturating_add(len as u64);
        if end > state.size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: state.size,
            });
        }

        let mut buf = vec![0u8; len];
        if len > 0 {
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.inner.lock();
        let offset = state.size;
        if !data.is_empty() {
            state.file.seek(SeekFrom::End(0))?;
            state.file.write_all(data)?;
            state.size += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        let mut state = self.inner.lock();
        state.file.flush()?;
        state.file.sync_data()?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut state = self.inner.lock();
        if new_size > state.size {
            return Err(StorageError::InvalidTruncate {
                size: state.size,
                requested: new_size,
            });
        }
        state.file.set_len(new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_nested_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db").join("txs.log");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn appended_bytes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txs.log");

        {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.append(b"first").unwrap(), 0);
            assert_eq!(backend.append(b"second").unwrap(), 5);
            backend.flush().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(5, 6).unwrap(), b"second");
    }

    #[test]
    fn truncate_then_append_reuses_offset() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(&dir.path().join("txs.log")).unwrap();
        backend.append(b"keep").unwrap();
        backend.append(b"torn").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.append(b"next").unwrap(), 4);
        assert_eq!(backend.read_at(0, 8).unwrap(), b"keepnext");
        assert!(matches!(
            backend.read_at(6, 4),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }
}
