//! # blockwire storage
//!
//! Append-only byte backends for the blockwire transaction log.
//!
//! Backends are **opaque byte stores**: they never interpret the records
//! they hold. The log owns the record format, torn-tail detection and
//! replay; a backend only reads, appends, flushes and truncates.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - shared in-process buffer for tests and ephemeral logs
//! - [`FileBackend`] - a single file, optionally held under an exclusive
//!   advisory lock so only one process appends at a time
//!
//! ## Example
//!
//! ```rust
//! use blockwire_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append_vectored(&[b"hello", b" world"]).unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
