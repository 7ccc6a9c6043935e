//! Content-addressed blob store.
//!
//! Blobs are appended as frames:
//!
//! ```text
//! | magic "DGBL" (4) | len u64 LE (8) | sha256 (32) | content (len) |
//! ```
//!
//! The in-memory index (digest -> frame position) is rebuilt by scanning the
//! frames when the store is opened. A torn frame at the tail is cut off; a bad
//! magic or digest anywhere else is corruption.

use crate::error::{StorageError, StorageResult};
use crate::store::ByteStore;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Magic bytes at the start of every blob frame.
pub const BLOB_MAGIC: [u8; 4] = *b"DGBL";

const HEADER_LEN: usize = 4 + 8 + 32;

/// Identifier of a stored blob: the SHA-256 digest of its content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// Computes the id `content` would be stored under.
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({self})")
    }
}

impl FromStr for BlobId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(StorageError::InvalidBlobId(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| StorageError::InvalidBlobId(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, Copy)]
struct FramePos {
    offset: u64,
    len: u64,
}

/// Content-addressed blob store over a [`ByteStore`].
pub struct BlobStore<S: ByteStore> {
    store: S,
    index: RwLock<HashMap<BlobId, FramePos>>,
}

impl<S: ByteStore> BlobStore<S> {
    /// Opens a blob store, rebuilding the index from existing frames.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptedFrame`] if a frame has a bad magic or
    /// its content does not match its digest.
    pub fn open(store: S) -> StorageResult<Self> {
        let (index, valid_len) = Self::scan(&store)?;
        if valid_len < store.len()? {
            tracing::warn!(valid_len, "truncating torn blob frame");
            store.truncate(valid_len)?;
        }
        tracing::debug!(blobs = index.len(), "blob index rebuilt");
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    fn scan(store: &S) -> StorageResult<(HashMap<BlobId, FramePos>, u64)> {
        let size = store.len()?;
        let mut index = HashMap::new();
        let mut offset = 0u64;

        while offset < size {
            if size - offset < HEADER_LEN as u64 {
                break;
            }
            let header = store.read_at(offset, HEADER_LEN)?;
            if header[0..4] != BLOB_MAGIC {
                return Err(StorageError::corrupted(offset, "bad magic"));
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&header[4..12]);
            let len = u64::from_le_bytes(len_bytes);
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&header[12..44]);

            let content_offset = offset + HEADER_LEN as u64;
            if size - content_offset < len {
                break;
            }
            let content_len = usize::try_from(len)
                .map_err(|_| StorageError::corrupted(offset, "length overflow"))?;
            let content = store.read_at(content_offset, content_len)?;
            let id = BlobId::of(&content);
            if id.0 != digest {
                return Err(StorageError::corrupted(offset, "digest mismatch"));
            }

            index.insert(
                id,
                FramePos {
                    offset: content_offset,
                    len,
                },
            );
            offset = content_offset + len;
        }

        Ok((index, offset))
    }

    /// Stores `content` and returns its id. Storing identical content twice
    /// appends nothing the second time.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    pub fn put(&self, content: &[u8]) -> StorageResult<BlobId> {
        let id = BlobId::of(content);
        let mut index = self.index.write();
        if index.contains_key(&id) {
            return Ok(id);
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + content.len());
        frame.extend_from_slice(&BLOB_MAGIC);
        frame.extend_from_slice(&(content.len() as u64).to_le_bytes());
        frame.extend_from_slice(id.as_bytes());
        frame.extend_from_slice(content);

        let offset = self.store.append(&frame)?;
        self.store.flush()?;
        index.insert(
            id,
            FramePos {
                offset: offset + HEADER_LEN as u64,
                len: content.len() as u64,
            },
        );
        Ok(id)
    }

    /// Reads a blob back. Returns `None` for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    pub fn get(&self, id: &BlobId) -> StorageResult<Option<Vec<u8>>> {
        let pos = match self.index.read().get(id) {
            Some(pos) => *pos,
            None => return Ok(None),
        };
        let len = usize::try_from(pos.len)
            .map_err(|_| StorageError::corrupted(pos.offset, "length overflow"))?;
        self.store.read_at(pos.offset, len).map(Some)
    }

    /// Returns `true` if a blob with this id is stored.
    #[must_use]
    pub fn contains(&self, id: &BlobId) -> bool {
        self.index.read().contains_key(id)
    }

    /// Number of distinct blobs.
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileStore, InMemoryStore};
    use proptest::prelude::*;

    #[test]
    fn put_get() {
        let blobs = BlobStore::open(InMemoryStore::new()).unwrap();
        let id = blobs.put(b"hello").unwrap();
        assert_eq!(blobs.get(&id).unwrap().unwrap(), b"hello");
        assert!(blobs.contains(&id));
    }

    #[test]
    fn identical_content_is_stored_once() {
        let blobs = BlobStore::open(InMemoryStore::new()).unwrap();
        let a = blobs.put(b"same").unwrap();
        let b = blobs.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(blobs.count(), 1);
    }

    #[test]
    fn unknown_id_is_none() {
        let blobs = BlobStore::open(InMemoryStore::new()).unwrap();
        assert!(blobs.get(&BlobId::of(b"missing")).unwrap().is_none());
    }

    #[test]
    fn id_display_roundtrip() {
        let id = BlobId::of(b"x");
        let parsed: BlobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("zz".parse::<BlobId>().is_err());
    }

    #[test]
    fn index_rebuilt_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.bin");
        let id = {
            let blobs = BlobStore::open(FileStore::open(&path).unwrap()).unwrap();
            blobs.put(b"report.pdf contents").unwrap()
        };

        let blobs = BlobStore::open(FileStore::open(&path).unwrap()).unwrap();
        assert_eq!(blobs.get(&id).unwrap().unwrap(), b"report.pdf contents");
    }

    #[test]
    fn torn_tail_is_ignored() {
        let blobs = BlobStore::open(InMemoryStore::new()).unwrap();
        let id = blobs.put(b"abc").unwrap();
        let mut data = blobs.store.snapshot();
        data.extend_from_slice(&BLOB_MAGIC);
        data.extend_from_slice(&[1, 0]);

        let reopened = BlobStore::open(InMemoryStore::with_data(data)).unwrap();
        assert!(reopened.contains(&id));
        assert_eq!(reopened.count(), 1);

        let next = reopened.put(b"def").unwrap();
        let data = reopened.store.snapshot();
        let again = BlobStore::open(InMemoryStore::with_data(data)).unwrap();
        assert_eq!(again.get(&next).unwrap().unwrap(), b"def");
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut data = vec![0u8; HEADER_LEN];
        data[0..4].copy_from_slice(b"XXXX");
        let result = BlobStore::open(InMemoryStore::with_data(data));
        assert!(matches!(result, Err(StorageError::CorruptedFrame { .. })));
    }

    proptest! {
        #[test]
        fn stored_blobs_read_back(contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8)) {
            let blobs = BlobStore::open(InMemoryStore::new()).unwrap();
            let ids: Vec<_> = contents.iter().map(|c| blobs.put(c).unwrap()).collect();
            for (id, content) in ids.iter().zip(&contents) {
                prop_assert_eq!(&blobs.get(id).unwrap().unwrap(), content);
            }
        }
    }
}
