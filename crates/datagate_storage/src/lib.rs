//! # datagate storage
//!
//! Byte-level storage used by datagate backends for file contents.
//!
//! Two layers live here:
//!
//! - [`ByteStore`]: an opaque append-only byte log. [`InMemoryStore`] keeps the
//!   bytes in memory, [`FileStore`] keeps them in a single file.
//! - [`BlobStore`]: framed, content-addressed blobs on top of any `ByteStore`.
//!   Blobs are identified by the SHA-256 digest of their content, so writing
//!   the same file twice stores it once.
//!
//! ## Example
//!
//! ```rust
//! use datagate_storage::{BlobStore, InMemoryStore};
//!
//! let blobs = BlobStore::open(InMemoryStore::new()).unwrap();
//! let id = blobs.put(b"%PDF-1.7 ...").unwrap();
//! assert_eq!(blobs.get(&id).unwrap().unwrap(), b"%PDF-1.7 ...");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod error;
mod file;
mod memory;
mod store;

pub use blob::{BlobId, BlobStore, BLOB_MAGIC};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::ByteStore;
