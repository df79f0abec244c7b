//! # chainkv storage
//!
//! Append-only byte backends underneath the chainkv transaction log.
//!
//! Backends never interpret what they hold. The core crate frames,
//! checksums and hash-chains every record; a backend only has to keep
//! appended bytes readable at the offset it returned and make them durable
//! on `flush`/`sync`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests
//! - [`FileBackend`] - a single append-only file
//! - [`FaultyBackend`] - wraps another backend and fails on demand
//!
//! ```rust
//! use chainkv_storage::{InMemoryBackend, StorageBackend};
//!
//! let backend = InMemoryBackend::new();
//! let offset = backend.append(b"tx record").unwrap();
//! assert_eq!(backend.read_at(offset, 9).unwrap(), b"tx record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod fault;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use fault::{FaultSwitch, FaultyBackend};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
