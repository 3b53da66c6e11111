//! # segdb storage
//!
//! Byte-region backends underneath segdb segments.
//!
//! A backend is an **opaque byte region**: it can be appended to, read at an
//! offset, overwritten in place where bytes already exist, streamed into a
//! sink, flushed and truncated. It knows nothing about record framing,
//! segment headers or addresses; `segdb_core` owns all of that.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and in-memory stores
//! - [`FileBackend`] - For persistent segments using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use segdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{BackendAppender, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
